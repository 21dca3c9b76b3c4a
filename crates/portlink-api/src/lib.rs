//! HTTP and WebSocket surface of the portlink control plane
//!
//! One axum router carries three surfaces: the management API (bearer-JWT
//! protected), the federation endpoints peers call with share tokens, and
//! the WebSocket endpoint agents and admin observers connect to.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod ws;

use axum::extract::State;
use axum::http::header;
use axum::middleware::{self as axum_middleware, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use portlink_control::{CommandChannel, Orchestrator};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::models::{ApiResponse, CODE_UNAUTHORIZED};

/// Application state shared across handlers
pub struct AppState {
    pub db: DatabaseConnection,
    pub channel: Arc<CommandChannel>,
    pub orchestrator: Arc<Orchestrator>,
    pub jwt: auth::JwtValidator,
    pub jwt_secret: String,
}

impl AppState {
    pub fn new(
        db: DatabaseConnection,
        channel: Arc<CommandChannel>,
        orchestrator: Arc<Orchestrator>,
        jwt_secret: impl Into<String>,
    ) -> Self {
        let jwt_secret = jwt_secret.into();
        AppState {
            db,
            channel,
            orchestrator,
            jwt: auth::JwtValidator::new(&jwt_secret),
            jwt_secret,
        }
    }
}

/// Build the full router: management API, federation endpoints, WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin_router = Router::new()
        // nodes
        .route("/api/v1/node/list", post(handlers::nodes::list_nodes))
        .route("/api/v1/node/create", post(handlers::nodes::create_node))
        .route("/api/v1/node/update", post(handlers::nodes::update_node))
        .route("/api/v1/node/delete", post(handlers::nodes::delete_node))
        .route("/api/v1/node/import", post(handlers::federation::import_remote_node))
        .route("/api/v1/node/upgrade", post(handlers::nodes::upgrade_agents))
        .route("/api/v1/node/rollback", post(handlers::nodes::rollback_agent))
        // tunnels
        .route("/api/v1/tunnel/list", post(handlers::tunnels::list_tunnels))
        .route("/api/v1/tunnel/create", post(handlers::tunnels::create_tunnel))
        .route("/api/v1/tunnel/update", post(handlers::tunnels::update_tunnel))
        .route("/api/v1/tunnel/delete", post(handlers::tunnels::delete_tunnel))
        .route("/api/v1/tunnel/diagnose", post(handlers::tunnels::diagnose_tunnel))
        .route("/api/v1/tunnel/redeploy", post(handlers::tunnels::redeploy_tunnel))
        .route(
            "/api/v1/tunnel/batch-redeploy",
            post(handlers::tunnels::batch_redeploy_tunnels),
        )
        .route("/api/v1/tunnel/limiter/set", post(handlers::tunnels::set_limiter))
        .route("/api/v1/tunnel/limiter/clear", post(handlers::tunnels::clear_limiter))
        // forwards
        .route("/api/v1/forward/list", post(handlers::forwards::list_forwards))
        .route("/api/v1/forward/create", post(handlers::forwards::create_forward))
        .route("/api/v1/forward/update", post(handlers::forwards::update_forward))
        .route("/api/v1/forward/delete", post(handlers::forwards::delete_forward))
        .route("/api/v1/forward/pause", post(handlers::forwards::pause_forward))
        .route("/api/v1/forward/resume", post(handlers::forwards::resume_forward))
        .route("/api/v1/forward/diagnose", post(handlers::forwards::diagnose_forward))
        .route(
            "/api/v1/forward/batch-delete",
            post(handlers::forwards::batch_delete_forwards),
        )
        .route(
            "/api/v1/forward/batch-pause",
            post(handlers::forwards::batch_pause_forwards),
        )
        .route(
            "/api/v1/forward/batch-resume",
            post(handlers::forwards::batch_resume_forwards),
        )
        .route(
            "/api/v1/forward/batch-redeploy",
            post(handlers::forwards::batch_redeploy_forwards),
        )
        // peer shares
        .route("/api/v1/share/list", post(handlers::federation::list_peer_shares))
        .route("/api/v1/share/create", post(handlers::federation::create_peer_share))
        .route("/api/v1/share/update", post(handlers::federation::update_peer_share))
        .route("/api/v1/share/delete", post(handlers::federation::delete_peer_share))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ));

    let federation_router = Router::new()
        .route(
            "/api/v1/federation/connect",
            post(handlers::federation::federation_connect),
        )
        .route(
            "/api/v1/federation/tunnel/create",
            post(handlers::federation::federation_tunnel_create),
        )
        .route(
            "/api/v1/federation/runtime/reserve-port",
            post(handlers::federation::runtime_reserve_port),
        )
        .route(
            "/api/v1/federation/runtime/apply-role",
            post(handlers::federation::runtime_apply_role),
        )
        .route(
            "/api/v1/federation/runtime/release-role",
            post(handlers::federation::runtime_release_role),
        )
        .route(
            "/api/v1/federation/runtime/diagnose",
            post(handlers::federation::runtime_diagnose),
        );

    Router::new()
        .route("/api/v1/ws", get(ws::ws_handler))
        .merge(admin_router)
        .merge(federation_router)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject management API calls without a valid admin bearer token.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("");

    if token.is_empty() || state.jwt.validate(token).is_err() {
        return ApiResponse::with_code(CODE_UNAUTHORIZED, "invalid or expired token")
            .into_response();
    }
    next.run(request).await
}
