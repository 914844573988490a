//! REST API handlers.
//!
//! Handlers are thin: they decode the request, call the orchestrator (or
//! the registry for node traffic) and map the outcome to a status code.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use provisor_orchestrator::ProvisionError;
use provisor_placement::PlacementRequest;
use provisor_registry::NodeAnnouncement;
use provisor_state::Attributes;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            code: None,
        }),
    )
        .into_response()
}

/// Map an orchestrator error to status, machine-readable code and message.
fn provision_error(err: ProvisionError) -> Response {
    let (status, code) = match &err {
        ProvisionError::NoHealthyNodes => (StatusCode::SERVICE_UNAVAILABLE, "no_healthy_nodes"),
        ProvisionError::NoCapacity => (StatusCode::SERVICE_UNAVAILABLE, "no_capacity"),
        ProvisionError::DuplicateNode(_) => (StatusCode::CONFLICT, "duplicate_node"),
        ProvisionError::UnknownNode(_) => (StatusCode::NOT_FOUND, "unknown_node"),
        ProvisionError::NodeCommandTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "node_command_timeout"),
        ProvisionError::NodeCommandFailure { .. } => (StatusCode::BAD_GATEWAY, "node_command_failure"),
        ProvisionError::NodeLost { .. } => (StatusCode::BAD_GATEWAY, "node_lost"),
        ProvisionError::LedgerInconsistency { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "ledger_inconsistency")
        }
        ProvisionError::FlowAborted { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "flow_aborted"),
        ProvisionError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        ProvisionError::BindingNotFound(_) => (StatusCode::NOT_FOUND, "binding_not_found"),
        ProvisionError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        ProvisionError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        ProvisionError::State(_) => (StatusCode::INTERNAL_SERVER_ERROR, "state"),
    };
    if status.is_server_error() {
        error!(error = %err, code, "request failed");
    } else {
        debug!(error = %err, code, "request rejected");
    }
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
            code: Some(code),
        }),
    )
        .into_response()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> Response {
    match state.orchestrator.ledger().list() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => provision_error(e.into()),
    }
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.ledger().lookup(&id) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("instance not found", StatusCode::NOT_FOUND),
        Err(e) => provision_error(e.into()),
    }
}

/// POST /api/v1/instances
pub async fn provision_instance(
    State(state): State<ApiState>,
    Json(req): Json<PlacementRequest>,
) -> Response {
    match state.orchestrator.provision(req).await {
        Ok(outcome) if outcome.created => (StatusCode::CREATED, ApiResponse::ok(outcome)).into_response(),
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => provision_error(e),
    }
}

/// DELETE /api/v1/instances/{id}
pub async fn unprovision_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.unprovision(&id).await {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => provision_error(e),
    }
}

// ── Bindings ───────────────────────────────────────────────────

/// Bind request body.
#[derive(Debug, Default, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub options: Value,
}

/// GET /api/v1/instances/{id}/bindings
pub async fn list_bindings(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.list_bindings(&id) {
        Ok(bindings) => ApiResponse::ok(bindings).into_response(),
        Err(e) => provision_error(e),
    }
}

/// POST /api/v1/instances/{id}/bindings
pub async fn create_binding(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<BindRequest>,
) -> Response {
    match state.orchestrator.bind(&id, req.options).await {
        Ok(binding) => (StatusCode::CREATED, ApiResponse::ok(binding)).into_response(),
        Err(e) => provision_error(e),
    }
}

/// DELETE /api/v1/instances/{id}/bindings/{binding_id}
pub async fn delete_binding(
    State(state): State<ApiState>,
    Path((id, binding_id)): Path<(String, String)>,
) -> Response {
    match state.orchestrator.unbind(&id, &binding_id).await {
        Ok(()) => ApiResponse::ok("unbound").into_response(),
        Err(e) => provision_error(e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.orchestrator.registry().snapshot()).into_response()
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.registry().get(&id) {
        Some(node) => ApiResponse::ok(node).into_response(),
        None => error_response("node not found", StatusCode::NOT_FOUND),
    }
}

/// POST /api/v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(ann): Json<NodeAnnouncement>,
) -> Response {
    if ann.node_id.is_empty() || ann.address.is_empty() {
        return error_response("node_id and address are required", StatusCode::BAD_REQUEST);
    }
    let known = state.orchestrator.registry().get(&ann.node_id).is_some();
    match state.orchestrator.registry().register(ann, epoch_secs()) {
        Ok(view) if known => ApiResponse::ok(view).into_response(),
        Ok(view) => (StatusCode::CREATED, ApiResponse::ok(view)).into_response(),
        Err(e) => provision_error(e.into()),
    }
}

/// Heartbeat body. May be empty.
#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub capacity: Option<Attributes>,
}

/// POST /api/v1/nodes/{id}/heartbeat
pub async fn node_heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let req = if body.is_empty() {
        HeartbeatRequest::default()
    } else {
        match serde_json::from_slice::<HeartbeatRequest>(&body) {
            Ok(req) => req,
            Err(e) => return error_response(&format!("invalid heartbeat: {e}"), StatusCode::BAD_REQUEST),
        }
    };
    match state
        .orchestrator
        .registry()
        .heartbeat(&id, epoch_secs(), req.capacity)
    {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => provision_error(e.into()),
    }
}

// ── Operations ─────────────────────────────────────────────────

/// POST /api/v1/reconcile
pub async fn reconcile(State(state): State<ApiState>) -> Response {
    match state.orchestrator.reconcile().await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => provision_error(e),
    }
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<ApiState>) -> Response {
    match state.orchestrator.stats() {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(e) => provision_error(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use provisor_ledger::InstanceLedger;
    use provisor_orchestrator::{MemoryChannel, NodeBehaviour, Orchestrator, OrchestratorConfig, RetryPolicy};
    use provisor_registry::{NodeRegistry, RegistryConfig};
    use provisor_state::StateStore;

    use super::*;
    use crate::build_router;

    fn test_app() -> (axum::Router, Arc<MemoryChannel>) {
        let state = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(NodeRegistry::new(state.clone(), RegistryConfig::default()));
        let channel = Arc::new(MemoryChannel::new());
        let config = OrchestratorConfig::default()
            .with_node_timeout(Duration::from_millis(50))
            .with_retry(RetryPolicy::none());
        let orchestrator = Orchestrator::new(InstanceLedger::new(state, registry), channel.clone(), config);
        (build_router(Arc::new(orchestrator)), channel)
    }

    async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register(app: &axum::Router, id: &str, memory: u64) {
        let (status, _) = send(
            app,
            "POST",
            "/api/v1/nodes",
            Some(json!({
                "node_id": id,
                "address": format!("{id}:9400"),
                "capacity": { "memory": memory },
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    fn provision_body(id: &str, memory: u64) -> Value {
        json!({
            "instance_id": id,
            "requester": "tenant-a",
            "profile": { "memory": memory },
        })
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn provision_and_unprovision_round_trip() {
        let (app, _) = test_app();
        register(&app, "node-x", 512).await;
        register(&app, "node-y", 1024).await;

        let (status, body) = send(&app, "POST", "/api/v1/instances", Some(provision_body("i1", 100))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["instance"]["node_id"], "node-y");
        assert_eq!(body["data"]["instance"]["state"], "provisioned");

        let (status, body) = send(&app, "POST", "/api/v1/instances", Some(provision_body("i1", 100))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["created"], false);

        let (status, body) = send(&app, "GET", "/api/v1/nodes/node-y", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["reserved"]["memory"], 100);

        let (status, _) = send(&app, "DELETE", "/api/v1/instances/i1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", "/api/v1/instances/i1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "gone");
        assert_eq!(body["data"]["residue"], false);

        let (status, body) = send(&app, "DELETE", "/api/v1/instances/i1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, body) = send(&app, "POST", "/api/v1/instances", Some(provision_body("i1", 100))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");
        let (_, body) = send(&app, "GET", "/api/v1/nodes/node-y", None).await;
        assert_eq!(body["data"]["reserved"]["memory"], 0);
    }

    #[tokio::test]
    async fn provision_errors_map_to_status() {
        let (app, channel) = test_app();

        let (status, body) = send(&app, "POST", "/api/v1/instances", Some(provision_body("i1", 100))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "no_healthy_nodes");

        register(&app, "node-z", 50).await;
        let (status, body) = send(&app, "POST", "/api/v1/instances", Some(provision_body("i1", 100))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "no_capacity");

        channel.set_behaviour("node-z", NodeBehaviour::Reject("maintenance".into()));
        let (status, body) = send(&app, "POST", "/api/v1/instances", Some(provision_body("i2", 10))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "node_command_failure");

        channel.set_behaviour("node-z", NodeBehaviour::Hang);
        let (status, body) = send(&app, "POST", "/api/v1/instances", Some(provision_body("i3", 10))).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["code"], "node_command_timeout");
    }

    #[tokio::test]
    async fn duplicate_node_registration_conflicts() {
        let (app, _) = test_app();
        register(&app, "node-x", 512).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/nodes",
            Some(json!({ "node_id": "node-x", "address": "elsewhere:1", "capacity": { "memory": 1 } })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "duplicate_node");
    }

    #[tokio::test]
    async fn heartbeat_with_and_without_body() {
        let (app, _) = test_app();
        register(&app, "node-x", 512).await;

        let (status, _) = send(&app, "POST", "/api/v1/nodes/node-x/heartbeat", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/nodes/node-x/heartbeat",
            Some(json!({ "capacity": { "memory": 2048 } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["capacity"]["memory"], 2048);

        let (status, body) = send(&app, "POST", "/api/v1/nodes/ghost/heartbeat", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "unknown_node");
    }

    #[tokio::test]
    async fn bindings_lifecycle() {
        let (app, _) = test_app();
        register(&app, "node-x", 512).await;
        send(&app, "POST", "/api/v1/instances", Some(provision_body("i1", 100))).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/instances/i1/bindings",
            Some(json!({ "options": { "app": "demo" } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let binding_id = body["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["data"]["credentials"]["host"], "node-x:9400");

        let (_, body) = send(&app, "GET", "/api/v1/instances/i1/bindings", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let uri = format!("/api/v1/instances/i1/bindings/{binding_id}");
        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "binding_not_found");
    }

    #[tokio::test]
    async fn stats_and_reconcile() {
        let (app, _) = test_app();
        register(&app, "node-x", 512).await;
        send(&app, "POST", "/api/v1/instances", Some(provision_body("i1", 100))).await;

        let (status, body) = send(&app, "GET", "/api/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["instances"]["provisioned"], 1);
        assert_eq!(body["data"]["nodes"]["healthy"], 1);

        let (status, body) = send(&app, "POST", "/api/v1/reconcile", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["migrated"], 0);
    }

    #[tokio::test]
    async fn list_endpoints_start_empty() {
        let (app, _) = test_app();
        let (status, body) = send(&app, "GET", "/api/v1/instances", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));

        let (status, body) = send(&app, "GET", "/api/v1/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }
}
