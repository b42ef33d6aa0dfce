//! Client for the Recovery Services backup REST API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    AsyncOperation, ControlPlane, OperationStatus, ProtectRequest, ProtectionBinding,
    ProtectionStatus,
};
use crate::error::RemoteError;
use crate::identity::{BACKUP_FABRIC, ProtectedItemIdentity, RECOVERY_SERVICES_PROVIDER};

const PROTECTED_ITEMS_API_VERSION: &str = "2016-12-01";
const VAULTS_API_VERSION: &str = "2016-06-01";
const PROTECTED_ITEM_TYPE: &str = "Microsoft.Compute/virtualMachines";
const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";
const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedItemResource {
    #[serde(default)]
    id: String,
    #[serde(default)]
    properties: ProtectedItemProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedItemProperties {
    #[serde(default)]
    source_resource_id: String,
    #[serde(default)]
    policy_id: String,
    #[serde(default)]
    protection_state: String,
}

#[derive(Debug, Deserialize)]
struct OperationStatusBody {
    status: Option<String>,
    error: Option<ArmErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ArmErrorBody {
    error: Option<ArmErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ArmErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Client for the Recovery Services control plane of one subscription.
#[derive(Clone)]
pub struct ArmClient {
    http: reqwest::Client,
    endpoint: Url,
    subscription_id: String,
    token: String,
}

impl ArmClient {
    pub fn new(
        endpoint: &str,
        subscription_id: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("Invalid control plane endpoint")?;
        if endpoint.cannot_be_a_base() {
            anyhow::bail!("Control plane endpoint {} cannot be a base URL", endpoint);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint,
            subscription_id: subscription_id.into(),
            token: token.into(),
        })
    }

    fn url(&self, segments: &[&str], api_version: &str) -> Result<Url, RemoteError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Transport("endpoint cannot be a base URL".to_string()))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    fn vault_segments<'a>(&'a self, resource_group: &'a str, vault_name: &'a str) -> Vec<&'a str> {
        vec![
            "subscriptions",
            self.subscription_id.as_str(),
            "resourceGroups",
            resource_group,
            "providers",
            RECOVERY_SERVICES_PROVIDER,
            "vaults",
            vault_name,
        ]
    }

    fn item_url(
        &self,
        vault_name: &str,
        resource_group: &str,
        container_name: &str,
        protected_item_name: &str,
    ) -> Result<Url, RemoteError> {
        let mut segments = self.vault_segments(resource_group, vault_name);
        segments.extend([
            "backupFabrics",
            BACKUP_FABRIC,
            "protectionContainers",
            container_name,
            "protectedItems",
            protected_item_name,
        ]);
        self.url(&segments, PROTECTED_ITEMS_API_VERSION)
    }

    fn identity_url(&self, identity: &ProtectedItemIdentity) -> Result<Url, RemoteError> {
        self.item_url(
            identity.vault_name(),
            identity.resource_group(),
            &identity.container_name(),
            &identity.protected_item_name(),
        )
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Response, RemoteError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(%method, %url, request_id = %request_id, "Control plane request");

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(CLIENT_REQUEST_ID_HEADER, request_id);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        classify(response).await
    }
}

/// Turn a non-success response into a [`RemoteError`].
async fn classify(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let text = response
        .text()
        .await
        .map_err(|e| RemoteError::Transport(e.to_string()))?;
    let detail = serde_json::from_str::<ArmErrorBody>(&text)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_default();
    let message = if detail.message.is_empty() {
        text
    } else {
        detail.message
    };

    Err(match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Throttled { retry_after },
        s if s.is_server_error() => RemoteError::Server {
            status: s.as_u16(),
            message,
        },
        s => RemoteError::Rejected {
            status: s.as_u16(),
            code: detail.code,
            message,
        },
    })
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Build an operation handle from a submission response.
async fn operation_from_response(response: Response) -> Result<AsyncOperation, RemoteError> {
    let location = response
        .headers()
        .get(ASYNC_OPERATION_HEADER)
        .or_else(|| response.headers().get(reqwest::header::LOCATION))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match (response.status(), location) {
        (StatusCode::ACCEPTED, Some(location)) => Ok(AsyncOperation::pending(location)),
        (StatusCode::ACCEPTED, None) => Err(RemoteError::Decode(
            "202 Accepted without an operation location".to_string(),
        )),
        (_, _) => {
            let text = response
                .text()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            let mut op = AsyncOperation::completed();
            op.result = serde_json::from_str(&text).ok();
            Ok(op)
        }
    }
}

fn operation_status_from(status: &str, error: Option<ArmErrorDetail>) -> OperationStatus {
    match status {
        "Succeeded" => OperationStatus::Succeeded,
        "Failed" | "Canceled" | "Cancelled" => {
            let detail = error.unwrap_or_default();
            OperationStatus::Failed {
                code: if detail.code.is_empty() {
                    status.to_string()
                } else {
                    detail.code
                },
                message: detail.message,
            }
        }
        _ => OperationStatus::InProgress,
    }
}

#[async_trait]
impl ControlPlane for ArmClient {
    async fn get_protected_item(
        &self,
        vault_name: &str,
        resource_group: &str,
        container_name: &str,
        protected_item_name: &str,
    ) -> Result<ProtectionBinding, RemoteError> {
        let url = self.item_url(vault_name, resource_group, container_name, protected_item_name)?;
        let response = self.send(Method::GET, url, None).await?;
        let item: ProtectedItemResource = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        Ok(ProtectionBinding {
            id: item.id,
            source_vm_id: item.properties.source_resource_id,
            policy_id: item.properties.policy_id,
            status: ProtectionStatus::from_arm(&item.properties.protection_state),
        })
    }

    async fn protect(
        &self,
        identity: &ProtectedItemIdentity,
        request: &ProtectRequest,
    ) -> Result<AsyncOperation, RemoteError> {
        let url = self.identity_url(identity)?;
        let body = json!({
            "properties": {
                "protectedItemType": PROTECTED_ITEM_TYPE,
                "sourceResourceId": request.source_vm_id,
                "policyId": request.policy_id,
            }
        });
        let response = self.send(Method::PUT, url, Some(body)).await?;
        operation_from_response(response).await
    }

    async fn unprotect(
        &self,
        identity: &ProtectedItemIdentity,
    ) -> Result<AsyncOperation, RemoteError> {
        let url = self.identity_url(identity)?;
        let response = self.send(Method::DELETE, url, None).await?;
        operation_from_response(response).await
    }

    async fn operation_status(
        &self,
        operation: &AsyncOperation,
    ) -> Result<AsyncOperation, RemoteError> {
        if operation.status.is_terminal() {
            return Ok(operation.clone());
        }
        let url = Url::parse(&operation.location)
            .map_err(|e| RemoteError::Decode(format!("invalid operation location: {}", e)))?;
        let response = self.send(Method::GET, url, None).await?;
        let http_status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let body: Option<OperationStatusBody> = serde_json::from_str(&text).ok();

        let status = match body {
            Some(OperationStatusBody {
                status: Some(status),
                error,
            }) => operation_status_from(&status, error),
            _ if http_status == StatusCode::ACCEPTED => OperationStatus::InProgress,
            _ => OperationStatus::Succeeded,
        };

        Ok(AsyncOperation {
            location: operation.location.clone(),
            status,
            result: serde_json::from_str(&text).ok(),
        })
    }

    async fn delete_vault(&self, resource_group: &str, vault_name: &str) -> Result<(), RemoteError> {
        let url = self.url(&self.vault_segments(resource_group, vault_name), VAULTS_API_VERSION)?;
        self.send(Method::DELETE, url, None).await?;
        Ok(())
    }
}
