//! provisor-api: REST API for the provisioning control plane.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/instances` | List ledger entries |
//! | POST | `/api/v1/instances` | Provision an instance |
//! | GET | `/api/v1/instances/{id}` | Get an instance |
//! | DELETE | `/api/v1/instances/{id}` | Unprovision an instance |
//! | GET | `/api/v1/instances/{id}/bindings` | List bindings |
//! | POST | `/api/v1/instances/{id}/bindings` | Bind |
//! | DELETE | `/api/v1/instances/{id}/bindings/{binding_id}` | Unbind |
//! | GET | `/api/v1/nodes` | Registry snapshot |
//! | POST | `/api/v1/nodes` | Register a node |
//! | GET | `/api/v1/nodes/{id}` | Get a node |
//! | POST | `/api/v1/nodes/{id}/heartbeat` | Node heartbeat |
//! | POST | `/api/v1/reconcile` | Run a reconcile pass now |
//! | GET | `/api/v1/stats` | Counters |
//!
//! Every JSON response uses the envelope `{ success, data?, error?, code? }`.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use provisor_orchestrator::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let api_state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/instances", get(handlers::list_instances).post(handlers::provision_instance))
        .route("/instances/{id}", get(handlers::get_instance).delete(handlers::unprovision_instance))
        .route("/instances/{id}/bindings", get(handlers::list_bindings).post(handlers::create_binding))
        .route("/instances/{id}/bindings/{binding_id}", delete(handlers::delete_binding))
        .route("/nodes", get(handlers::list_nodes).post(handlers::register_node))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/nodes/{id}/heartbeat", post(handlers::node_heartbeat))
        .route("/reconcile", post(handlers::reconcile))
        .route("/stats", get(handlers::stats))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
