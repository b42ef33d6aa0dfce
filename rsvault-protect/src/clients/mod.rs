//! Control plane seam.
//!
//! The reconciler only talks to the backup control plane through
//! [`ControlPlane`]. The production implementation is [`ArmClient`], which
//! speaks the Recovery Services REST API; tests inject in-memory fakes.

pub mod arm;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::identity::ProtectedItemIdentity;

pub use arm::ArmClient;

/// Protection state of a VM as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionStatus {
    Protected,
    Protecting,
    ProtectionStopped,
    NotMapped,
    Expired,
}

impl ProtectionStatus {
    /// Map an ARM `protectionState` value.
    pub fn from_arm(state: &str) -> Self {
        match state {
            "Protected" => ProtectionStatus::Protected,
            "IRPending" | "Protecting" => ProtectionStatus::Protecting,
            "ProtectionStopped" | "ProtectionPaused" => ProtectionStatus::ProtectionStopped,
            "Expired" => ProtectionStatus::Expired,
            _ => ProtectionStatus::NotMapped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionStatus::Protected => "Protected",
            ProtectionStatus::Protecting => "Protecting",
            ProtectionStatus::ProtectionStopped => "ProtectionStopped",
            ProtectionStatus::NotMapped => "NotMapped",
            ProtectionStatus::Expired => "Expired",
        }
    }
}

impl fmt::Display for ProtectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side record of a protection binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionBinding {
    /// ARM ID of the protected item.
    pub id: String,
    /// Resource ID of the protected VM.
    pub source_vm_id: String,
    pub policy_id: String,
    pub status: ProtectionStatus,
}

/// Status of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed { code: String, message: String },
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::InProgress)
    }
}

/// Handle to a long-running control plane operation.
///
/// Only lives for the duration of one reconciliation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncOperation {
    /// URL (or opaque token for fakes) to query status with.
    pub location: String,
    pub status: OperationStatus,
    pub result: Option<serde_json::Value>,
}

impl AsyncOperation {
    /// An operation the control plane completed synchronously.
    pub fn completed() -> Self {
        Self {
            location: String::new(),
            status: OperationStatus::Succeeded,
            result: None,
        }
    }

    pub fn pending(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            status: OperationStatus::InProgress,
            result: None,
        }
    }
}

/// Request to enable (or re-point) protection of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectRequest {
    pub source_vm_id: String,
    pub policy_id: String,
}

/// Operations the reconciler needs from the backup control plane.
///
/// Implementations perform a single attempt per call; retries belong to the
/// caller.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Point lookup of a protected item. `Err(RemoteError::NotFound)` when
    /// the item does not exist.
    async fn get_protected_item(
        &self,
        vault_name: &str,
        resource_group: &str,
        container_name: &str,
        protected_item_name: &str,
    ) -> Result<ProtectionBinding, RemoteError>;

    /// Submit a protect request (create or policy change).
    async fn protect(
        &self,
        identity: &ProtectedItemIdentity,
        request: &ProtectRequest,
    ) -> Result<AsyncOperation, RemoteError>;

    /// Submit a stop-protection (unregister) request.
    async fn unprotect(&self, identity: &ProtectedItemIdentity)
    -> Result<AsyncOperation, RemoteError>;

    /// Refresh the status of an operation.
    async fn operation_status(&self, operation: &AsyncOperation)
    -> Result<AsyncOperation, RemoteError>;

    /// Delete a Recovery Services vault.
    async fn delete_vault(&self, resource_group: &str, vault_name: &str)
    -> Result<(), RemoteError>;
}
