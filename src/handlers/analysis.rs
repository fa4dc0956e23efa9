use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::AppState;
use crate::error::Error;
use crate::query::HIGH_CARDINALITY_FLOOR;
use crate::store::MAX_PAGE_LIMIT;

#[derive(Debug, Deserialize)]
pub struct ScanParams {
    pub threshold: Option<u64>,
    pub limit: Option<usize>,
}

fn limit_or_default(limit: Option<usize>) -> Result<usize, Error> {
    let limit = limit.unwrap_or(crate::store::DEFAULT_PAGE_LIMIT);
    if limit == 0 {
        return Err(Error::InvalidInput("limit must be positive".into()));
    }
    Ok(limit.min(MAX_PAGE_LIMIT))
}

/// Keys whose estimated cardinality clears the threshold, highest first.
pub async fn high_cardinality(
    State(state): State<AppState>,
    Query(params): Query<ScanParams>,
) -> Result<impl IntoResponse, Error> {
    let threshold = params.threshold.unwrap_or(HIGH_CARDINALITY_FLOOR);
    let limit = limit_or_default(params.limit)?;
    let hits = state.query.high_cardinality(threshold, limit).await?;
    Ok(Json(hits))
}

#[derive(Debug, Deserialize)]
pub struct ComplexityParams {
    pub threshold: Option<usize>,
    pub limit: Option<usize>,
}

/// Entities ranked by structural complexity.
pub async fn complexity(
    State(state): State<AppState>,
    Query(params): Query<ComplexityParams>,
) -> Result<impl IntoResponse, Error> {
    let threshold = params.threshold.unwrap_or(1);
    let limit = limit_or_default(params.limit)?;
    let reports = state.query.complexity(threshold, limit).await?;
    Ok(Json(reports))
}
