use super::handlers::{self, AppState};
use super::metrics_handler::metrics_handler;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Create the Axum router served on the consensus address
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Consensus RPC
        .route("/raft", post(handlers::raft_rpc))
        // Cluster introspection
        .route("/cluster", get(handlers::cluster_info))
        .route("/kv/stats", get(handlers::kv_stats))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
