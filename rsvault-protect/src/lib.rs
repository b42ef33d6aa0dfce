//! rsvault-protect: reconciliation engine for VM backup protection.
//!
//! Drives the binding between a virtual machine and a Recovery Services
//! vault backup policy toward declared state:
//! - derives composite item/container identities ([`identity`])
//! - reads current protection from the control plane ([`reader`])
//! - waits for long-running operations with bounded polling ([`poller`])
//! - creates, updates, reads and deletes bindings ([`reconciler`])
//! - asserts existence or absence for harnesses ([`verifier`])
//! - applies manifests, refreshes state and orders vault teardown
//!   ([`orchestrator`])

pub mod audit;
pub mod clients;
pub mod config;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod poller;
pub mod reader;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod verifier;

pub use audit::AuditLogger;
pub use clients::{
    ArmClient, AsyncOperation, ControlPlane, OperationStatus, ProtectRequest, ProtectionBinding,
    ProtectionStatus,
};
pub use config::{PollConfig, ReconcilerConfig, RetryPolicy, VerifyPolicy};
pub use error::{
    Operation, ReconcileError, ReconcileErrorKind, RemoteError, RemoteQueryError, VerifyError,
};
pub use identity::{IdentityError, ImportId, ProtectedItemIdentity};
pub use orchestrator::{ApplySummary, OrchestrationError, Orchestrator, RefreshSummary};
pub use poller::{AsyncOperationPoller, PollOutcome};
pub use reader::RemoteStateReader;
pub use reconciler::{BindingSpec, ProtectionReconciler, Reconciler};
pub use state::{Manifest, ResourceState, StateFile, VaultRef};
pub use verifier::ExistenceVerifier;
