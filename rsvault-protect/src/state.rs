//! Declared manifest and recorded resource state.
//!
//! Both are JSON documents keyed by resource address (for example
//! `protected_vm.web`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clients::{ProtectionBinding, ProtectionStatus};
use crate::identity::{IdentityError, ProtectedItemIdentity};
use crate::reconciler::BindingSpec;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Unsupported state version {0}")]
    Version(u32),

    #[error("Invalid vault reference '{0}', expected <resource-group>/<vault-name>")]
    InvalidVaultRef(String),
}

/// Desired bindings by address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub protected_vms: BTreeMap<String, BindingSpec>,
}

impl Manifest {
    pub async fn load(path: &Path) -> Result<Self, StateError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| StateError::Io {
                path: path.display().to_string(),
                source,
            })?;
        serde_json::from_str(&text).map_err(|source| StateError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Recorded attributes of one protected VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    pub resource_group_name: String,
    pub recovery_vault_name: String,
    pub source_vm_id: String,
    pub source_vm_name: String,
    pub backup_policy_id: String,
    pub protection_status: ProtectionStatus,
    pub refreshed_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn from_binding(
        identity: &ProtectedItemIdentity,
        subscription_id: &str,
        binding: &ProtectionBinding,
    ) -> Self {
        let id = if binding.id.is_empty() {
            identity.resource_id(subscription_id)
        } else {
            binding.id.clone()
        };
        Self {
            id,
            resource_group_name: identity.resource_group().to_string(),
            recovery_vault_name: identity.vault_name().to_string(),
            source_vm_id: binding.source_vm_id.clone(),
            source_vm_name: identity.vm_name().to_string(),
            backup_policy_id: binding.policy_id.clone(),
            protection_status: binding.status,
            refreshed_at: Utc::now(),
        }
    }

    /// Refresh observed attributes from a fresh read.
    pub fn observe(&mut self, binding: &ProtectionBinding) {
        if !binding.source_vm_id.is_empty() {
            self.source_vm_id = binding.source_vm_id.clone();
        }
        self.backup_policy_id = binding.policy_id.clone();
        self.protection_status = binding.status;
        self.refreshed_at = Utc::now();
    }

    /// Rederive the identity from the recorded VM ID.
    pub fn identity(&self) -> Result<ProtectedItemIdentity, IdentityError> {
        ProtectedItemIdentity::from_vm_id(
            &self.source_vm_id,
            &self.resource_group_name,
            &self.recovery_vault_name,
        )
    }

    /// Whether moving to `spec` needs delete + create rather than an update.
    /// Only the policy can change in place.
    pub fn requires_replacement(&self, spec: &BindingSpec) -> bool {
        !self.resource_group_name.eq_ignore_ascii_case(&spec.resource_group_name)
            || !self.recovery_vault_name.eq_ignore_ascii_case(&spec.recovery_vault_name)
            || !self.source_vm_id.eq_ignore_ascii_case(&spec.source_vm_id)
    }

    pub fn in_vault(&self, vault: &VaultRef) -> bool {
        vault.holds(&self.resource_group_name, &self.recovery_vault_name)
    }
}

/// Recorded state of all managed bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            resources: BTreeMap::new(),
        }
    }
}

impl StateFile {
    /// Load state, starting empty when the file does not exist yet.
    pub async fn load(path: &Path) -> Result<Self, StateError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let state: Self = serde_json::from_str(&text).map_err(|source| StateError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if state.version != STATE_VERSION {
            return Err(StateError::Version(state.version));
        }
        Ok(state)
    }

    /// Write state atomically (temp file + rename).
    pub async fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source: std::io::Error| StateError::Io {
            path: path.display().to_string(),
            source,
        };
        let text = serde_json::to_string_pretty(self).map_err(|source| StateError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}

/// A vault addressed as `<resource-group>/<vault-name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRef {
    pub resource_group: String,
    pub name: String,
}

impl VaultRef {
    /// Whether a binding in `resource_group`/`vault_name` lives in this vault.
    pub fn holds(&self, resource_group: &str, vault_name: &str) -> bool {
        self.resource_group.eq_ignore_ascii_case(resource_group)
            && self.name.eq_ignore_ascii_case(vault_name)
    }
}

impl FromStr for VaultRef {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((rg, name)) if !rg.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self {
                    resource_group: rg.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(StateError::InvalidVaultRef(s.to_string())),
        }
    }
}

impl fmt::Display for VaultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.name)
    }
}
