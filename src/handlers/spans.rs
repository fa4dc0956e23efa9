use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;

use super::ListParams;
use crate::AppState;
use crate::error::Error;
use crate::store::MetadataStore;

pub async fn list_spans(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, Error> {
    let page = state
        .store
        .list_spans(params.page()?, params.service())
        .await?;
    Ok(Json(page))
}

pub async fn get_span(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let meta = state.store.get_span(&name).await?;
    Ok(Json(meta))
}
