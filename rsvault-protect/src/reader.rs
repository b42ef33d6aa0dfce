//! Point lookups of protection bindings.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clients::{ControlPlane, ProtectionBinding};
use crate::config::RetryPolicy;
use crate::error::{RemoteError, RemoteQueryError};
use crate::identity::ProtectedItemIdentity;
use crate::retry::with_retries;

/// Reads the current protection binding for an identity.
///
/// "Not found" is a valid answer (`Ok(None)`), distinct from a failed query.
#[derive(Clone)]
pub struct RemoteStateReader {
    client: Arc<dyn ControlPlane>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RemoteStateReader {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            retry,
            cancel,
        }
    }

    /// Look up a protected item by its raw coordinates.
    pub async fn fetch(
        &self,
        vault_name: &str,
        resource_group: &str,
        container_name: &str,
        protected_item_name: &str,
    ) -> Result<Option<ProtectionBinding>, RemoteQueryError> {
        let result = with_retries(&self.retry, &self.cancel, "get protected item", move || {
            self.client.get_protected_item(
                vault_name,
                resource_group,
                container_name,
                protected_item_name,
            )
        })
        .await;

        match result {
            Ok(binding) => {
                debug!(
                    vault = vault_name,
                    item = protected_item_name,
                    status = %binding.status,
                    "Protected item found"
                );
                Ok(Some(binding))
            }
            Err(RemoteError::NotFound) => {
                debug!(vault = vault_name, item = protected_item_name, "Protected item not found");
                Ok(None)
            }
            Err(cause) => Err(RemoteQueryError {
                vault: vault_name.to_string(),
                item: protected_item_name.to_string(),
                cause,
            }),
        }
    }

    /// Look up the binding for an identity.
    pub async fn fetch_identity(
        &self,
        identity: &ProtectedItemIdentity,
    ) -> Result<Option<ProtectionBinding>, RemoteQueryError> {
        self.fetch(
            identity.vault_name(),
            identity.resource_group(),
            &identity.container_name(),
            &identity.protected_item_name(),
        )
        .await
    }
}
