use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;

use super::ListParams;
use crate::AppState;
use crate::error::Error;
use crate::store::{MetadataStore, Page};

pub async fn list_services(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, Error> {
    let services = state.store.list_services().await?;
    Ok(Json(Page::paginate(services, params.page()?)))
}

/// Everything one service touches, per signal class.
pub async fn service_overview(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let overview = state.query.service_overview(&name).await?;
    Ok(Json(overview))
}
