use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde_json::json;

use super::ListParams;
use crate::AppState;
use crate::error::Error;
use crate::store::MetadataStore;

pub async fn list_metrics(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, Error> {
    let page = state
        .store
        .list_metrics(params.page()?, params.service())
        .await?;
    Ok(Json(page))
}

pub async fn get_metric(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let meta = state.store.get_metric(&name).await?;
    Ok(Json(meta))
}

/// Active-series estimate for one metric name.
pub async fn metric_cardinality(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let active_series = state.query.active_series(&name).await?;
    Ok(Json(json!({
        "name": name,
        "active_series": active_series,
    })))
}
