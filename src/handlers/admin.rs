use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

use crate::AppState;
use crate::error::Error;
use crate::store::MetadataStore;

/// Wipe every entity, the attribute catalog, and the service set.
pub async fn clear(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    state.store.clear().await?;
    tracing::info!("metadata store cleared by admin request");
    Ok(Json(json!({ "status": "cleared" })))
}
