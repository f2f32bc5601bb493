use crate::cluster::Cluster;
use crate::cluster::raft::{RaftRequest, RaftResponse};
use crate::core::{KVStats, KVStore};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Shared state of the HTTP surface
#[derive(Clone)]
pub struct AppState {
    pub store: KVStore,
    pub cluster: Option<Arc<Cluster>>,
}

impl AppState {
    pub fn standalone(store: KVStore) -> Self {
        Self {
            store,
            cluster: None,
        }
    }

    pub fn clustered(cluster: Arc<Cluster>) -> Self {
        Self {
            store: cluster.store().clone(),
            cluster: Some(cluster),
        }
    }
}

fn cluster_disabled() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": "cluster mode is disabled",
            "code": StatusCode::SERVICE_UNAVAILABLE.as_u16(),
        })),
    )
        .into_response()
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "shardis",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": if state.cluster.is_some() { "cluster" } else { "standalone" },
    }))
}

/// POST /raft - consensus RPC from another voter
pub async fn raft_rpc(State(state): State<AppState>, Json(request): Json<RaftRequest>) -> Response {
    let Some(cluster) = state.cluster else {
        return cluster_disabled();
    };
    let response: RaftResponse = cluster.raft().handle(request).await;
    Json(response).into_response()
}

/// GET /cluster - raft status, members and in-flight tasks
pub async fn cluster_info(State(state): State<AppState>) -> Response {
    let Some(cluster) = state.cluster else {
        return cluster_disabled();
    };
    debug!("REST CLUSTER");

    let (migrations, failovers) = cluster.fsm().with_state(|s| {
        (
            s.migratings.values().cloned().collect::<Vec<_>>(),
            s.failovers.values().cloned().collect::<Vec<_>>(),
        )
    });
    Json(json!({
        "id": cluster.id(),
        "raft": cluster.raft().status(),
        "nodes": cluster.nodes(),
        "migrations": migrations,
        "failovers": failovers,
        "replicating_from": cluster.replicating_from(),
    }))
    .into_response()
}

/// GET /kv/stats
pub async fn kv_stats(State(state): State<AppState>) -> Json<KVStats> {
    debug!("REST STATS");
    Json(state.store.stats())
}
