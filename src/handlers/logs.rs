use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use super::ListParams;
use crate::AppState;
use crate::error::Error;
use crate::store::MetadataStore;

pub async fn list_logs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, Error> {
    let page = state
        .store
        .list_logs(params.page()?, params.service())
        .await?;
    Ok(Json(page))
}

pub async fn get_log(
    State(state): State<AppState>,
    Path(severity): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let meta = state.store.get_log(&severity).await?;
    Ok(Json(meta))
}

#[derive(Debug, Deserialize)]
pub struct PatternParams {
    #[serde(default)]
    pub min_count: u64,
    #[serde(default)]
    pub min_services: usize,
    pub limit: Option<usize>,
}

/// Body templates grouped across severities, with per-service breakdowns.
pub async fn log_patterns(
    State(state): State<AppState>,
    Query(params): Query<PatternParams>,
) -> Result<impl IntoResponse, Error> {
    let mut groups = state
        .query
        .log_patterns(params.min_count, params.min_services)
        .await?;
    if let Some(limit) = params.limit {
        groups.truncate(limit.min(crate::store::MAX_PAGE_LIMIT));
    }
    Ok(Json(groups))
}
