use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

use crate::AppState;
use crate::store::MetadataStore;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let miner = state.analyzer.miner().map(|m| {
        json!({
            "clusters": m.total_clusters(),
            "evictions": m.evictions(),
        })
    });
    Json(json!({
        "status": "ok",
        "ingest": state.stats.snapshot(state.store.flush_stats()),
        "miner": miner,
    }))
}
