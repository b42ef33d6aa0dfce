//! Drives apply, refresh, destroy and import over a manifest and state file.
//!
//! Ordering rules:
//! - A binding whose VM, vault or resource group changed is deleted before its
//!   replacement is created.
//! - Every binding in a vault is deleted and verified absent before the vault
//!   itself is deleted. A vault that still holds a recorded binding is never
//!   handed to the control plane for deletion.
//! - A create whose outcome is unknown is recorded as `Protecting` so the
//!   binding still blocks its vault and is unprotected on destroy.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audit::AuditLogger;
use crate::clients::{ControlPlane, ProtectionBinding, ProtectionStatus};
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, ReconcileErrorKind, RemoteError, VerifyError};
use crate::identity::IdentityError;
use crate::reconciler::ProtectionReconciler;
use crate::retry::with_retries;
use crate::state::{Manifest, ResourceState, StateError, StateFile, VaultRef};
use crate::verifier::ExistenceVerifier;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("{address}: {source}")]
    Reconcile {
        address: String,
        source: ReconcileError,
    },

    #[error("{address}: {source}")]
    Identity {
        address: String,
        source: IdentityError,
    },

    #[error("{address}: {source}")]
    Verify {
        address: String,
        source: VerifyError,
    },

    #[error("Vault {vault} still has protected items: {}", .items.join(", "))]
    VaultInUse { vault: String, items: Vec<String> },

    #[error("Failed to delete vault {vault}: {source}")]
    VaultDelete { vault: String, source: RemoteError },

    #[error("Resource {0} is already managed")]
    AlreadyManaged(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// What an apply changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub replaced: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

/// What a refresh observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub in_sync: Vec<String>,
    /// Recorded bindings whose policy differs remotely.
    pub drifted: Vec<String>,
    /// Recorded bindings that no longer exist; dropped from state.
    pub missing: Vec<String>,
}

/// The protect request was accepted but the outcome is unknown.
fn may_complete_remotely(err: &ReconcileError) -> bool {
    matches!(
        err.kind,
        ReconcileErrorKind::TimedOut(_)
            | ReconcileErrorKind::Cancelled
            | ReconcileErrorKind::NotFoundAfterCreate { .. }
    )
}

pub struct Orchestrator {
    reconciler: ProtectionReconciler,
    verifier: ExistenceVerifier,
    client: Arc<dyn ControlPlane>,
    config: ReconcilerConfig,
    cancel: CancellationToken,
    subscription_id: String,
    audit: Arc<AuditLogger>,
    state_path: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        subscription_id: impl Into<String>,
        config: ReconcilerConfig,
        cancel: CancellationToken,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let reconciler = ProtectionReconciler::new(
            client.clone(),
            config.clone(),
            cancel.clone(),
            audit.clone(),
        );
        let verifier = ExistenceVerifier::new(reconciler.reader().clone());
        Self {
            reconciler,
            verifier,
            client,
            config,
            cancel,
            subscription_id: subscription_id.into(),
            audit,
            state_path: None,
        }
    }

    /// Persist state to `path` after every successful step.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn verifier(&self) -> &ExistenceVerifier {
        &self.verifier
    }

    async fn persist(&self, state: &StateFile) -> Result<(), OrchestrationError> {
        if let Some(path) = &self.state_path {
            state.save(path).await?;
        }
        Ok(())
    }

    /// Delete one recorded binding and verify it is gone.
    async fn destroy_binding(
        &self,
        address: &str,
        recorded: &ResourceState,
    ) -> Result<(), OrchestrationError> {
        let identity = recorded
            .identity()
            .map_err(|source| OrchestrationError::Identity {
                address: address.to_string(),
                source,
            })?;
        self.reconciler
            .delete(&identity)
            .await
            .map_err(|source| OrchestrationError::Reconcile {
                address: address.to_string(),
                source,
            })?;
        self.verifier
            .assert_absent(&identity)
            .await
            .map_err(|source| OrchestrationError::Verify {
                address: address.to_string(),
                source,
            })
    }

    /// Converge the recorded state onto `manifest`.
    pub async fn apply(
        &self,
        manifest: &Manifest,
        state: &mut StateFile,
    ) -> Result<ApplySummary, OrchestrationError> {
        info!(
            "Applying manifest ({} protected VMs, {} recorded)",
            manifest.protected_vms.len(),
            state.resources.len()
        );
        let mut summary = ApplySummary::default();

        for (address, spec) in &manifest.protected_vms {
            let previous = state.resources.get(address).cloned();

            if let Some(recorded) = &previous {
                if recorded.requires_replacement(spec) {
                    info!("Replacing {} (VM, vault or resource group changed)", address);
                    self.destroy_binding(address, recorded).await?;
                    state.resources.remove(address);
                    self.persist(state).await?;
                }
            }

            let identity = spec
                .identity()
                .map_err(|source| OrchestrationError::Identity {
                    address: address.clone(),
                    source,
                })?;
            let binding = match self.reconciler.create(spec).await {
                Ok(binding) => binding,
                Err(source) => {
                    if may_complete_remotely(&source) {
                        warn!(
                            "{} may still be protected remotely, recording it as pending",
                            address
                        );
                        let pending = ProtectionBinding {
                            id: String::new(),
                            source_vm_id: spec.source_vm_id.clone(),
                            policy_id: spec.backup_policy_id.clone(),
                            status: ProtectionStatus::Protecting,
                        };
                        let recorded = ResourceState::from_binding(
                            &identity,
                            &self.subscription_id,
                            &pending,
                        );
                        state.resources.insert(address.clone(), recorded);
                        self.persist(state).await?;
                    }
                    return Err(OrchestrationError::Reconcile {
                        address: address.clone(),
                        source,
                    });
                }
            };

            let mut recorded =
                ResourceState::from_binding(&identity, &self.subscription_id, &binding);
            if recorded.source_vm_id.is_empty() {
                recorded.source_vm_id = spec.source_vm_id.clone();
            }

            match &previous {
                None => summary.created.push(address.clone()),
                Some(prev) if prev.requires_replacement(spec) => {
                    summary.replaced.push(address.clone())
                }
                Some(prev)
                    if !prev
                        .backup_policy_id
                        .eq_ignore_ascii_case(&spec.backup_policy_id) =>
                {
                    summary.updated.push(address.clone())
                }
                Some(_) => summary.unchanged.push(address.clone()),
            }

            state.resources.insert(address.clone(), recorded);
            self.persist(state).await?;
        }

        let orphaned: Vec<String> = state
            .resources
            .keys()
            .filter(|address| !manifest.protected_vms.contains_key(*address))
            .cloned()
            .collect();
        for address in orphaned {
            info!("Pruning {}", address);
            if let Some(recorded) = state.resources.get(&address).cloned() {
                self.destroy_binding(&address, &recorded).await?;
            }
            state.resources.remove(&address);
            self.persist(state).await?;
            summary.deleted.push(address);
        }

        Ok(summary)
    }

    /// Re-read every recorded binding and update state from what exists.
    pub async fn refresh(
        &self,
        state: &mut StateFile,
    ) -> Result<RefreshSummary, OrchestrationError> {
        let mut summary = RefreshSummary::default();
        let addresses: Vec<String> = state.resources.keys().cloned().collect();

        for address in addresses {
            let Some(recorded) = state.resources.get_mut(&address) else {
                continue;
            };
            let identity = recorded
                .identity()
                .map_err(|source| OrchestrationError::Identity {
                    address: address.clone(),
                    source,
                })?;
            let observed = self
                .reconciler
                .read(&identity)
                .await
                .map_err(|source| OrchestrationError::Reconcile {
                    address: address.clone(),
                    source,
                })?;

            match observed {
                None => {
                    warn!(
                        "{} no longer exists remotely and will be recreated on apply",
                        address
                    );
                    self.audit.drift(&identity, "binding missing");
                    state.resources.remove(&address);
                    summary.missing.push(address);
                }
                Some(binding) => {
                    if !binding.policy_id.eq_ignore_ascii_case(&recorded.backup_policy_id) {
                        warn!(
                            "{} policy drifted: recorded {}, remote {}",
                            address, recorded.backup_policy_id, binding.policy_id
                        );
                        self.audit.drift(&identity, "backup policy changed");
                        summary.drifted.push(address.clone());
                    } else {
                        summary.in_sync.push(address.clone());
                    }
                    recorded.observe(&binding);
                }
            }
            self.persist(state).await?;
        }

        Ok(summary)
    }

    /// Delete every recorded binding, then the given vaults.
    ///
    /// Bindings declared in `manifest` but missing from state are checked
    /// remotely before any vault is deleted.
    pub async fn destroy(
        &self,
        state: &mut StateFile,
        manifest: Option<&Manifest>,
        vaults: &[VaultRef],
    ) -> Result<Vec<String>, OrchestrationError> {
        let mut deleted = Vec::new();
        let addresses: Vec<String> = state.resources.keys().cloned().collect();

        for address in addresses {
            if let Some(recorded) = state.resources.get(&address).cloned() {
                info!("Destroying {}", address);
                self.destroy_binding(&address, &recorded).await?;
            }
            state.resources.remove(&address);
            self.persist(state).await?;
            deleted.push(address);
        }

        for vault in vaults {
            self.delete_vault(state, manifest, vault).await?;
        }
        Ok(deleted)
    }

    /// Delete a vault once no binding in it is recorded or visible remotely.
    pub async fn delete_vault(
        &self,
        state: &StateFile,
        manifest: Option<&Manifest>,
        vault: &VaultRef,
    ) -> Result<(), OrchestrationError> {
        let mut items: Vec<String> = state
            .resources
            .iter()
            .filter(|(_, r)| r.in_vault(vault))
            .map(|(address, _)| address.clone())
            .collect();

        let declared = manifest
            .into_iter()
            .flat_map(|m| m.protected_vms.iter())
            .filter(|(address, spec)| {
                vault.holds(&spec.resource_group_name, &spec.recovery_vault_name)
                    && !items.contains(*address)
            });
        let mut remote = Vec::new();
        for (address, spec) in declared {
            let identity = spec
                .identity()
                .map_err(|source| OrchestrationError::Identity {
                    address: address.clone(),
                    source,
                })?;
            match self.verifier.assert_absent(&identity).await {
                Ok(()) => {}
                Err(VerifyError::StillExists(_)) => remote.push(address.clone()),
                Err(source) => {
                    return Err(OrchestrationError::Verify {
                        address: address.clone(),
                        source,
                    });
                }
            }
        }
        items.extend(remote);

        if !items.is_empty() {
            error!("Refusing to delete vault {} while it protects {:?}", vault, items);
            return Err(OrchestrationError::VaultInUse {
                vault: vault.to_string(),
                items,
            });
        }

        info!("Deleting vault {}", vault);
        let result = with_retries(&self.config.retry, &self.cancel, "delete vault", || {
            self.client.delete_vault(&vault.resource_group, &vault.name)
        })
        .await;

        match result {
            Ok(()) => {}
            Err(RemoteError::NotFound) => info!("Vault {} already absent", vault),
            Err(source) => {
                return Err(OrchestrationError::VaultDelete {
                    vault: vault.to_string(),
                    source,
                });
            }
        }
        self.audit.vault_deleted(&vault.resource_group, &vault.name);
        Ok(())
    }

    /// Bring an existing binding under management at `address`.
    pub async fn import(
        &self,
        state: &mut StateFile,
        address: &str,
        import_id: &str,
    ) -> Result<ResourceState, OrchestrationError> {
        if state.resources.contains_key(address) {
            return Err(OrchestrationError::AlreadyManaged(address.to_string()));
        }

        let (parsed, binding) = self
            .reconciler
            .import(import_id)
            .await
            .map_err(|source| OrchestrationError::Reconcile {
                address: address.to_string(),
                source,
            })?;

        let recorded =
            ResourceState::from_binding(&parsed.identity, &parsed.subscription_id, &binding);
        state.resources.insert(address.to_string(), recorded.clone());
        self.persist(state).await?;
        self.audit.imported(&parsed.identity, address);
        Ok(recorded)
    }
}
