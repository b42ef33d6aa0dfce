//! Reconcilers for backup resources.
//!
//! Each reconciler compares desired state (declared spec) with actual state
//! (from the control plane) and takes actions to converge.

pub mod protected_vm;

use async_trait::async_trait;

use crate::error::ReconcileError;

pub use protected_vm::{BindingSpec, ProtectionReconciler};

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The declared spec.
    type Spec: Send + Sync;
    /// Address of the remote resource.
    type Id: Send + Sync;
    /// The observed state to report back.
    type Status: Send;

    /// Reconcile the resource - compare desired vs actual state and take action.
    async fn reconcile(&self, spec: &Self::Spec) -> Result<Self::Status, ReconcileError>;

    /// Observe the resource without changing it. `None` means absent.
    async fn observe(&self, id: &Self::Id) -> Result<Option<Self::Status>, ReconcileError>;

    /// Handle resource deletion (finalization).
    async fn finalize(&self, id: &Self::Id) -> Result<(), ReconcileError>;
}
