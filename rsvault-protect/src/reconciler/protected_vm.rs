//! Protected VM reconciler - binds a VM to a backup policy in a vault.
//!
//! Lifecycle of one binding:
//! - create: Absent -> Protecting -> Protected
//! - update: Protected -> Protected (same protect call, new policy)
//! - delete: Protected -> ProtectionStopped -> Absent
//!
//! The control plane is eventually consistent. A finished operation does not
//! mean reads reflect it yet, so create and delete both re-check existence a
//! bounded number of times before reporting success.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::audit::AuditLogger;
use crate::clients::{
    AsyncOperation, ControlPlane, ProtectRequest, ProtectionBinding, ProtectionStatus,
};
use crate::config::ReconcilerConfig;
use crate::error::{Operation, ReconcileError, ReconcileErrorKind, RemoteError};
use crate::identity::{IdentityError, ImportId, ProtectedItemIdentity};
use crate::poller::{AsyncOperationPoller, PollOutcome};
use crate::reader::RemoteStateReader;
use crate::retry::{sleep_or_cancel, with_retries};

/// Declared protection of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub resource_group_name: String,
    pub recovery_vault_name: String,
    pub source_vm_id: String,
    pub backup_policy_id: String,
}

impl BindingSpec {
    /// Derive the identity of the binding this spec declares.
    pub fn identity(&self) -> Result<ProtectedItemIdentity, IdentityError> {
        ProtectedItemIdentity::from_vm_id(
            &self.source_vm_id,
            &self.resource_group_name,
            &self.recovery_vault_name,
        )
    }
}

/// ARM IDs compare case-insensitively.
fn same_id(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Protection is enabled or being enabled. Initial backup keeps a fresh
/// binding in `Protecting` for a while.
fn is_active(binding: &ProtectionBinding) -> bool {
    matches!(
        binding.status,
        ProtectionStatus::Protected | ProtectionStatus::Protecting
    )
}

/// Reconciler for VM protection bindings.
pub struct ProtectionReconciler {
    client: Arc<dyn ControlPlane>,
    reader: RemoteStateReader,
    poller: AsyncOperationPoller,
    config: ReconcilerConfig,
    cancel: CancellationToken,
    audit: Arc<AuditLogger>,
}

impl ProtectionReconciler {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        config: ReconcilerConfig,
        cancel: CancellationToken,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let reader = RemoteStateReader::new(client.clone(), config.retry.clone(), cancel.clone());
        let poller = AsyncOperationPoller::new(
            client.clone(),
            config.poll.clone(),
            config.retry.clone(),
            cancel.clone(),
        );
        Self {
            client,
            reader,
            poller,
            config,
            cancel,
            audit,
        }
    }

    pub fn reader(&self) -> &RemoteStateReader {
        &self.reader
    }

    /// Ensure the VM in `spec` is protected with `spec.backup_policy_id`.
    ///
    /// No-op when the binding is already Protected (or Protecting) with the
    /// same policy.
    /// Otherwise submits a protect request, waits for it, and waits for the
    /// binding to become visible.
    pub async fn create(&self, spec: &BindingSpec) -> Result<ProtectionBinding, ReconcileError> {
        let identity = spec
            .identity()
            .map_err(|e| ReconcileError::input(&spec.source_vm_id, Operation::Create, e))?;
        let fail =
            |kind: ReconcileErrorKind| ReconcileError::new(&identity, Operation::Create, kind);

        info!(
            vault = identity.vault_name(),
            item = %identity.protected_item_name(),
            policy = %spec.backup_policy_id,
            "Reconciling protected VM"
        );

        let current = self
            .reader
            .fetch_identity(&identity)
            .await
            .map_err(|e| fail(e.cause.into()))?;

        if let Some(binding) = &current {
            if is_active(binding) && same_id(&binding.policy_id, &spec.backup_policy_id) {
                info!(
                    item = %identity.protected_item_name(),
                    status = %binding.status,
                    "Already protected with desired policy"
                );
                return Ok(binding.clone());
            }
            if !same_id(&binding.policy_id, &spec.backup_policy_id) {
                info!(
                    item = %identity.protected_item_name(),
                    from = %binding.policy_id,
                    to = %spec.backup_policy_id,
                    "Changing backup policy"
                );
            }
        }

        let request = ProtectRequest {
            source_vm_id: spec.source_vm_id.clone(),
            policy_id: spec.backup_policy_id.clone(),
        };
        let operation = with_retries(&self.config.retry, &self.cancel, "protect", || {
            self.client.protect(&identity, &request)
        })
        .await
        .map_err(|e| fail(e.into()))?;

        self.await_operation(operation).await.map_err(fail)?;

        let binding = self
            .await_visible(&identity, &spec.backup_policy_id)
            .await
            .map_err(fail)?;

        self.audit.protected(&identity, &spec.backup_policy_id);
        Ok(binding)
    }

    /// Change the policy of an existing binding. Same call as create.
    pub async fn update(&self, spec: &BindingSpec) -> Result<ProtectionBinding, ReconcileError> {
        self.create(spec).await
    }

    /// Current binding, or `None` when absent.
    pub async fn read(
        &self,
        identity: &ProtectedItemIdentity,
    ) -> Result<Option<ProtectionBinding>, ReconcileError> {
        self.reader
            .fetch_identity(identity)
            .await
            .map_err(|e| ReconcileError::new(identity, Operation::Read, e.cause))
    }

    /// Stop protection and unregister the item, then wait until reads agree it
    /// is gone. Deleting an absent binding succeeds.
    pub async fn delete(&self, identity: &ProtectedItemIdentity) -> Result<(), ReconcileError> {
        let fail =
            |kind: ReconcileErrorKind| ReconcileError::new(identity, Operation::Delete, kind);
        info!(
            vault = identity.vault_name(),
            item = %identity.protected_item_name(),
            "Stopping protection"
        );

        let submitted = with_retries(&self.config.retry, &self.cancel, "unprotect", || {
            self.client.unprotect(identity)
        })
        .await;

        match submitted {
            Ok(operation) => self.await_operation(operation).await.map_err(fail)?,
            Err(RemoteError::NotFound) => {
                info!(item = %identity.protected_item_name(), "Protected item already absent");
                return Ok(());
            }
            Err(e) => return Err(fail(e.into())),
        }

        self.await_absent(identity).await.map_err(fail)?;
        self.audit.unprotected(identity);
        Ok(())
    }

    /// Rebuild the identity from an import ID and read the binding.
    pub async fn import(
        &self,
        import_id: &str,
    ) -> Result<(ImportId, ProtectionBinding), ReconcileError> {
        let parsed = ImportId::parse(import_id)
            .map_err(|e| ReconcileError::input(import_id, Operation::Import, e))?;
        let binding = self
            .reader
            .fetch_identity(&parsed.identity)
            .await
            .map_err(|e| ReconcileError::new(&parsed.identity, Operation::Import, e.cause))?
            .ok_or_else(|| {
                ReconcileError::new(
                    &parsed.identity,
                    Operation::Import,
                    ReconcileErrorKind::NotFound,
                )
            })?;
        Ok((parsed, binding))
    }

    /// Map a poll outcome onto success or a failure kind.
    async fn await_operation(
        &self,
        operation: AsyncOperation,
    ) -> Result<(), ReconcileErrorKind> {
        match self.poller.wait_default(operation).await {
            PollOutcome::Succeeded(_) => Ok(()),
            PollOutcome::Failed { code, message } => {
                Err(ReconcileErrorKind::OperationFailed { code, message })
            }
            PollOutcome::TimedOut(after) => Err(ReconcileErrorKind::TimedOut(after)),
            PollOutcome::Cancelled => Err(ReconcileErrorKind::Cancelled),
            PollOutcome::Unreachable(e) => Err(ReconcileErrorKind::Remote(e)),
        }
    }

    /// Re-read until the binding shows up active with the desired policy.
    async fn await_visible(
        &self,
        identity: &ProtectedItemIdentity,
        policy_id: &str,
    ) -> Result<ProtectionBinding, ReconcileErrorKind> {
        let attempts = self.config.verify.attempts.max(1);
        for attempt in 1..=attempts {
            match self.reader.fetch_identity(identity).await {
                Ok(Some(binding))
                    if is_active(&binding) && same_id(&binding.policy_id, policy_id) =>
                {
                    debug!(attempt, status = %binding.status, "Binding visible");
                    return Ok(binding);
                }
                Ok(Some(binding)) => {
                    debug!(
                        attempt,
                        policy = %binding.policy_id,
                        status = %binding.status,
                        "Binding visible with stale state"
                    );
                }
                Ok(None) => debug!(attempt, "Binding not visible yet"),
                Err(e) => return Err(e.cause.into()),
            }
            if attempt < attempts
                && !sleep_or_cancel(&self.cancel, self.config.verify.interval).await
            {
                return Err(ReconcileErrorKind::Cancelled);
            }
        }
        warn!(
            item = %identity.protected_item_name(),
            attempts,
            "Binding never became visible"
        );
        Err(ReconcileErrorKind::NotFoundAfterCreate { attempts })
    }

    /// Re-read until the binding is gone.
    async fn await_absent(
        &self,
        identity: &ProtectedItemIdentity,
    ) -> Result<(), ReconcileErrorKind> {
        let attempts = self.config.verify.attempts.max(1);
        for attempt in 1..=attempts {
            match self.reader.fetch_identity(identity).await {
                Ok(None) => {
                    debug!(attempt, "Binding absent");
                    return Ok(());
                }
                Ok(Some(binding)) => {
                    debug!(
                        attempt,
                        status = %binding.status,
                        "Binding still listed after stop protection"
                    );
                }
                Err(e) => return Err(e.cause.into()),
            }
            if attempt < attempts
                && !sleep_or_cancel(&self.cancel, self.config.verify.interval).await
            {
                return Err(ReconcileErrorKind::Cancelled);
            }
        }
        warn!(
            item = %identity.protected_item_name(),
            attempts,
            "Binding still present after delete"
        );
        Err(ReconcileErrorKind::StillExists { attempts })
    }
}

#[async_trait]
impl Reconciler for ProtectionReconciler {
    type Spec = BindingSpec;
    type Id = ProtectedItemIdentity;
    type Status = ProtectionBinding;

    async fn reconcile(&self, spec: &Self::Spec) -> Result<Self::Status, ReconcileError> {
        self.create(spec).await
    }

    async fn observe(&self, id: &Self::Id) -> Result<Option<Self::Status>, ReconcileError> {
        self.read(id).await
    }

    async fn finalize(&self, id: &Self::Id) -> Result<(), ReconcileError> {
        self.delete(id).await
    }
}
