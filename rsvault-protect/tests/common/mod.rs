//! Shared test utilities for rsvault-protect integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use rsvault_protect::{
    ArmClient, AsyncOperation, AuditLogger, BindingSpec, ControlPlane, OperationStatus, PollConfig,
    ProtectRequest, ProtectedItemIdentity, ProtectionBinding, ProtectionReconciler,
    ProtectionStatus, ReconcilerConfig, RemoteError, RetryPolicy, VerifyPolicy,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";
pub const RESOURCE_GROUP: &str = "acctestRG-42";
pub const VAULT: &str = "acctest-42";
pub const VM: &str = "acctestvm";
pub const POLICY_A: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/acctestRG-42/providers/Microsoft.RecoveryServices/vaults/acctest-42/backupPolicies/DefaultPolicy";
pub const POLICY_B: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/acctestRG-42/providers/Microsoft.RecoveryServices/vaults/acctest-42/backupPolicies/WeeklyPolicy";

pub fn vm_id(vm_name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
        SUBSCRIPTION, RESOURCE_GROUP, vm_name
    )
}

pub fn spec(vm_name: &str, policy_id: &str) -> BindingSpec {
    BindingSpec {
        resource_group_name: RESOURCE_GROUP.to_string(),
        recovery_vault_name: VAULT.to_string(),
        source_vm_id: vm_id(vm_name),
        backup_policy_id: policy_id.to_string(),
    }
}

pub fn identity(vm_name: &str) -> ProtectedItemIdentity {
    ProtectedItemIdentity::new(RESOURCE_GROUP, vm_name, VAULT).unwrap()
}

/// Tunables sized for paused-clock tests.
pub fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        poll: PollConfig {
            max_wait: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(4),
            multiplier: 2,
        },
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(2),
        },
        verify: VerifyPolicy {
            attempts: 4,
            interval: Duration::from_secs(1),
        },
    }
}

/// Tunables sized for real-clock tests against the mock server.
pub fn realtime_config() -> ReconcilerConfig {
    ReconcilerConfig {
        poll: PollConfig {
            max_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
            multiplier: 2,
        },
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        },
        verify: VerifyPolicy {
            attempts: 5,
            interval: Duration::from_millis(10),
        },
    }
}

pub fn reconciler(
    client: Arc<dyn ControlPlane>,
    config: ReconcilerConfig,
    cancel: CancellationToken,
) -> ProtectionReconciler {
    ProtectionReconciler::new(client, config, cancel, Arc::new(AuditLogger::new("test")))
}

fn item_key(resource_group: &str, vault: &str, container: &str, item: &str) -> String {
    format!("{}/{}/{}/{}", resource_group, vault, container, item).to_lowercase()
}

fn identity_key(identity: &ProtectedItemIdentity) -> String {
    item_key(
        identity.resource_group(),
        identity.vault_name(),
        &identity.container_name(),
        &identity.protected_item_name(),
    )
}

enum Effect {
    Protect {
        key: String,
        binding: ProtectionBinding,
    },
    Unprotect {
        key: String,
    },
}

struct PendingOperation {
    remaining_polls: u32,
    effect: Effect,
}

/// Knobs and counters of the in-memory control plane.
#[derive(Default)]
pub struct FakeState {
    items: HashMap<String, ProtectionBinding>,
    operations: HashMap<String, PendingOperation>,
    next_operation: u64,
    /// Status checks before an operation finishes. 0 completes synchronously.
    pub polls_to_complete: u32,
    /// Operations never finish.
    pub stuck: bool,
    /// Finish operations with this code and message instead of succeeding.
    pub fail_with: Option<(String, String)>,
    /// Next N calls of any kind fail with a 503.
    pub transient_faults: u32,
    /// Reads that still return the binding after a delete finishes.
    pub stale_reads_after_delete: u32,
    /// Reads that miss the binding after a create finishes.
    pub invisible_reads_after_create: u32,
    /// Reads that still show the binding as stopped after a create finishes.
    pub stopped_reads_after_create: u32,
    stale: HashMap<String, (ProtectionBinding, u32)>,
    invisible: HashMap<String, u32>,
    pub protect_calls: u32,
    pub unprotect_calls: u32,
    pub read_calls: u32,
    pub status_calls: u32,
    pub deleted_vaults: Vec<String>,
}

/// In-memory control plane with scripted latency and faults.
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut *self.state.lock().unwrap())
    }

    /// Seed an existing binding.
    pub fn insert(&self, identity: &ProtectedItemIdentity, policy_id: &str, status: ProtectionStatus) {
        self.with(|s| {
            s.items.insert(
                identity_key(identity),
                ProtectionBinding {
                    id: identity.resource_id(SUBSCRIPTION),
                    source_vm_id: vm_id(identity.vm_name()),
                    policy_id: policy_id.to_string(),
                    status,
                },
            )
        });
    }

    /// Drop a binding out of band.
    pub fn remove(&self, identity: &ProtectedItemIdentity) {
        self.with(|s| s.items.remove(&identity_key(identity)));
    }

    pub fn binding(&self, identity: &ProtectedItemIdentity) -> Option<ProtectionBinding> {
        self.with(|s| s.items.get(&identity_key(identity)).cloned())
    }

    fn take_fault(state: &mut FakeState) -> Result<(), RemoteError> {
        if state.transient_faults > 0 {
            state.transient_faults -= 1;
            return Err(RemoteError::Server {
                status: 503,
                message: "Service Unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn submit(state: &mut FakeState, effect: Effect) -> AsyncOperation {
        if state.polls_to_complete == 0 && !state.stuck {
            return match state.fail_with.clone() {
                Some((code, message)) => AsyncOperation {
                    location: String::new(),
                    status: OperationStatus::Failed { code, message },
                    result: None,
                },
                None => {
                    Self::apply(state, effect);
                    AsyncOperation::completed()
                }
            };
        }
        state.next_operation += 1;
        let location = format!("fake-operation-{}", state.next_operation);
        state.operations.insert(
            location.clone(),
            PendingOperation {
                remaining_polls: state.polls_to_complete,
                effect,
            },
        );
        AsyncOperation::pending(location)
    }

    fn apply(state: &mut FakeState, effect: Effect) {
        match effect {
            Effect::Protect { key, binding } => {
                if state.invisible_reads_after_create > 0 {
                    state
                        .invisible
                        .insert(key.clone(), state.invisible_reads_after_create);
                }
                if state.stopped_reads_after_create > 0 {
                    let mut stopped = binding.clone();
                    stopped.status = ProtectionStatus::ProtectionStopped;
                    state
                        .stale
                        .insert(key.clone(), (stopped, state.stopped_reads_after_create));
                }
                state.items.insert(key, binding);
            }
            Effect::Unprotect { key } => {
                if let Some(mut binding) = state.items.remove(&key) {
                    if state.stale_reads_after_delete > 0 {
                        binding.status = ProtectionStatus::ProtectionStopped;
                        state
                            .stale
                            .insert(key, (binding, state.stale_reads_after_delete));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn get_protected_item(
        &self,
        vault_name: &str,
        resource_group: &str,
        container_name: &str,
        protected_item_name: &str,
    ) -> Result<ProtectionBinding, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.read_calls += 1;
        Self::take_fault(&mut state)?;
        let key = item_key(resource_group, vault_name, container_name, protected_item_name);

        if let Some((binding, remaining)) = state.stale.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(binding.clone());
            }
        }
        if let Some(remaining) = state.invisible.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::NotFound);
            }
        }
        state.items.get(&key).cloned().ok_or(RemoteError::NotFound)
    }

    async fn protect(
        &self,
        identity: &ProtectedItemIdentity,
        request: &ProtectRequest,
    ) -> Result<AsyncOperation, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.protect_calls += 1;
        Self::take_fault(&mut state)?;
        let effect = Effect::Protect {
            key: identity_key(identity),
            binding: ProtectionBinding {
                id: identity.resource_id(SUBSCRIPTION),
                source_vm_id: request.source_vm_id.clone(),
                policy_id: request.policy_id.clone(),
                status: ProtectionStatus::Protected,
            },
        };
        Ok(Self::submit(&mut state, effect))
    }

    async fn unprotect(
        &self,
        identity: &ProtectedItemIdentity,
    ) -> Result<AsyncOperation, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.unprotect_calls += 1;
        Self::take_fault(&mut state)?;
        let key = identity_key(identity);
        if !state.items.contains_key(&key) {
            return Err(RemoteError::NotFound);
        }
        Ok(Self::submit(&mut state, Effect::Unprotect { key }))
    }

    async fn operation_status(
        &self,
        operation: &AsyncOperation,
    ) -> Result<AsyncOperation, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        Self::take_fault(&mut state)?;
        if state.stuck {
            return Ok(operation.clone());
        }

        let Some(pending) = state.operations.get_mut(&operation.location) else {
            return Err(RemoteError::NotFound);
        };
        pending.remaining_polls = pending.remaining_polls.saturating_sub(1);
        if pending.remaining_polls > 0 {
            return Ok(operation.clone());
        }

        let Some(pending) = state.operations.remove(&operation.location) else {
            return Err(RemoteError::NotFound);
        };
        let status = match state.fail_with.clone() {
            Some((code, message)) => OperationStatus::Failed { code, message },
            None => {
                Self::apply(&mut state, pending.effect);
                OperationStatus::Succeeded
            }
        };
        Ok(AsyncOperation {
            location: operation.location.clone(),
            status,
            result: None,
        })
    }

    async fn delete_vault(&self, resource_group: &str, vault_name: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        Self::take_fault(&mut state)?;
        let prefix = format!("{}/{}/", resource_group, vault_name).to_lowercase();
        if state.items.keys().any(|k| k.starts_with(&prefix)) {
            return Err(RemoteError::Rejected {
                status: 409,
                code: "ServiceResourceNotEmpty".to_string(),
                message: "Vault cannot be deleted as there are existing resources within the vault"
                    .to_string(),
            });
        }
        state.deleted_vaults.push(format!("{}/{}", resource_group, vault_name));
        Ok(())
    }
}

/// Recorded request metadata of the mock ARM server.
#[derive(Debug, Clone, Default)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub client_request_id: Option<String>,
}

#[derive(Default)]
pub struct MockArmState {
    pub base_url: String,
    pub items: HashMap<String, Value>,
    operations: HashMap<String, (u32, MockEffect)>,
    next_operation: u64,
    /// Status checks before an operation finishes.
    pub polls_to_complete: u32,
    /// Finish operations with this ARM error instead of succeeding.
    pub fail_with: Option<(String, String)>,
    /// Next N item reads answer 429 with `Retry-After: 0`.
    pub throttle_reads: u32,
    pub requests: Vec<SeenRequest>,
    pub deleted_vaults: Vec<String>,
}

enum MockEffect {
    Protect { key: String, item: Value },
    Unprotect { key: String },
}

type Shared = Arc<Mutex<MockArmState>>;

type ItemPath = Path<(String, String, String, String, String)>;

fn arm_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

fn record(state: &mut MockArmState, method: &str, path: String, headers: &HeaderMap) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.push(SeenRequest {
        method: method.to_string(),
        path,
        authorization: header("authorization"),
        client_request_id: header("x-ms-client-request-id"),
    });
}

fn accept(state: &mut MockArmState, effect: MockEffect) -> Response {
    state.next_operation += 1;
    let id = state.next_operation.to_string();
    let location = format!("{}/operations/{}?api-version=2016-12-01", state.base_url, id);
    state
        .operations
        .insert(id, (state.polls_to_complete, effect));
    (StatusCode::ACCEPTED, [("Azure-AsyncOperation", location)]).into_response()
}

async fn get_item(
    State(shared): State<Shared>,
    Path((_sub, rg, vault, container, item)): ItemPath,
    headers: HeaderMap,
) -> Response {
    let mut state = shared.lock().unwrap();
    let key = item_key(&rg, &vault, &container, &item);
    record(&mut state, "GET", key.clone(), &headers);
    if state.throttle_reads > 0 {
        state.throttle_reads -= 1;
        return (StatusCode::TOO_MANY_REQUESTS, [("Retry-After", "0")]).into_response();
    }
    match state.items.get(&key) {
        Some(item) => Json(item.clone()).into_response(),
        None => arm_error(
            StatusCode::NOT_FOUND,
            "BMSUserErrorObjectNotFound",
            "Item not found",
        ),
    }
}

async fn put_item(
    State(shared): State<Shared>,
    Path((sub, rg, vault, container, item)): ItemPath,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = shared.lock().unwrap();
    let key = item_key(&rg, &vault, &container, &item);
    record(&mut state, "PUT", key.clone(), &headers);
    let properties = &body["properties"];
    let resource = json!({
        "id": format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.RecoveryServices/vaults/{}/backupFabrics/Azure/protectionContainers/{}/protectedItems/{}",
            sub, rg, vault, container, item
        ),
        "properties": {
            "protectedItemType": properties["protectedItemType"],
            "sourceResourceId": properties["sourceResourceId"],
            "policyId": properties["policyId"],
            "protectionState": "Protected",
        }
    });
    accept(&mut state, MockEffect::Protect { key, item: resource })
}

async fn delete_item(
    State(shared): State<Shared>,
    Path((_sub, rg, vault, container, item)): ItemPath,
    headers: HeaderMap,
) -> Response {
    let mut state = shared.lock().unwrap();
    let key = item_key(&rg, &vault, &container, &item);
    record(&mut state, "DELETE", key.clone(), &headers);
    if !state.items.contains_key(&key) {
        return arm_error(
            StatusCode::NOT_FOUND,
            "BMSUserErrorObjectNotFound",
            "Item not found",
        );
    }
    accept(&mut state, MockEffect::Unprotect { key })
}

async fn get_operation(
    State(shared): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut state = shared.lock().unwrap();
    record(&mut state, "GET", format!("operations/{}", id), &headers);
    let Some((remaining, _)) = state.operations.get_mut(&id) else {
        return arm_error(StatusCode::NOT_FOUND, "NotFound", "Unknown operation");
    };
    if *remaining > 0 {
        *remaining -= 1;
        return Json(json!({ "id": id, "status": "InProgress" })).into_response();
    }
    let Some((_, effect)) = state.operations.remove(&id) else {
        return arm_error(StatusCode::NOT_FOUND, "NotFound", "Unknown operation");
    };
    if let Some((code, message)) = state.fail_with.clone() {
        return Json(json!({
            "id": id,
            "status": "Failed",
            "error": { "code": code, "message": message },
        }))
        .into_response();
    }
    match effect {
        MockEffect::Protect { key, item } => {
            state.items.insert(key, item);
        }
        MockEffect::Unprotect { key } => {
            state.items.remove(&key);
        }
    }
    Json(json!({ "id": id, "status": "Succeeded" })).into_response()
}

async fn delete_vault(
    State(shared): State<Shared>,
    Path((_sub, rg, vault)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut state = shared.lock().unwrap();
    record(&mut state, "DELETE", format!("{}/{}", rg, vault), &headers);
    let prefix = format!("{}/{}/", rg, vault).to_lowercase();
    if state.items.keys().any(|k| k.starts_with(&prefix)) {
        return arm_error(
            StatusCode::CONFLICT,
            "ServiceResourceNotEmpty",
            "Vault has protected items",
        );
    }
    state.deleted_vaults.push(format!("{}/{}", rg, vault));
    StatusCode::OK.into_response()
}

/// Mock of the Recovery Services REST surface the client uses.
pub struct MockArmServer {
    pub addr: SocketAddr,
    pub state: Shared,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl MockArmServer {
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockArmState::default()));

        let vault = "/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.RecoveryServices/vaults/{vault}";
        let item = format!(
            "{}/backupFabrics/Azure/protectionContainers/{{container}}/protectedItems/{{item}}",
            vault
        );
        let router = Router::new()
            .route(&item, get(get_item).put(put_item).delete(delete_item))
            .route("/operations/{id}", get(get_operation))
            .route(vault, delete(delete_vault))
            .with_state(state.clone());

        // Port 0 lets the OS choose
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();
        state.lock().unwrap().base_url = format!("http://{}", addr);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown_tx,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockArmState) -> R) -> R {
        f(&mut *self.state.lock().unwrap())
    }

    /// Seed a protected item with a raw ARM `protectionState`.
    pub fn insert_item(
        &self,
        identity: &ProtectedItemIdentity,
        policy_id: &str,
        protection_state: &str,
    ) {
        let item = json!({
            "id": identity.resource_id(SUBSCRIPTION),
            "properties": {
                "protectedItemType": "Microsoft.Compute/virtualMachines",
                "sourceResourceId": vm_id(identity.vm_name()),
                "policyId": policy_id,
                "protectionState": protection_state,
            }
        });
        self.with(|s| s.items.insert(identity_key(identity), item));
    }

    pub fn has_item(&self, identity: &ProtectedItemIdentity) -> bool {
        self.with(|s| s.items.contains_key(&identity_key(identity)))
    }

    pub fn client(&self) -> Arc<dyn ControlPlane> {
        Arc::new(
            ArmClient::new(
                &self.endpoint(),
                SUBSCRIPTION,
                "test-token",
                Duration::from_secs(5),
            )
            .unwrap(),
        )
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
