//! HTTP API: router, shared state, and handlers.

pub mod artifacts;
pub mod dispatch;
pub mod envelope;
pub mod health;
pub mod workspaces;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::get;
use tower_http::cors::CorsLayer;

use outpost_core::Error;
use outpost_core::artifacts::ArtifactStore;
use outpost_core::health::FleetHealth;
use outpost_core::orchestrator::DispatchOrchestrator;
use outpost_core::status::StatusTracker;
use outpost_core::store::DispatchStore;

use envelope::ApiError;

/// Header carrying the authenticated tenant id (stamped by the auth
/// middleware in front of this service).
pub const USER_HEADER: &str = "x-outpost-user";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: DispatchStore,
    pub orchestrator: Arc<DispatchOrchestrator>,
    pub tracker: StatusTracker,
    pub artifacts: Arc<ArtifactStore>,
    pub health: Arc<FleetHealth>,
}

/// The tenant identity for a request.
///
/// Authentication itself happens upstream; a request arriving without the
/// identity header is refused.
pub fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| {
            ApiError(Error::authorization(format!(
                "missing tenant identity header {USER_HEADER}"
            )))
        })
}

/// Build the full router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/dispatch",
            axum::routing::post(dispatch::create_dispatch),
        )
        .route(
            "/dispatch/{id}",
            get(dispatch::get_dispatch).delete(dispatch::cancel_dispatch),
        )
        .route("/dispatches", get(dispatch::list_dispatches))
        .route("/artifacts/{dispatch_id}", get(artifacts::get_artifacts))
        .route("/workspaces", get(workspaces::list_workspaces))
        .route(
            "/workspaces/{id}",
            get(workspaces::get_workspace).delete(workspaces::delete_workspace),
        )
        .route("/health", get(health::overall))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/health/fleet", get(health::fleet))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
