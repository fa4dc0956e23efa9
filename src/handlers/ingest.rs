//! OTLP/HTTP JSON intake.
//!
//! The minimal in-repo producer: deserializes collector-style JSON export
//! requests into the decoded payload types and hands them to the
//! analyzers. Protobuf and gRPC intake stay with the external receivers.

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;

use crate::AppState;
use crate::error::Error;
use crate::pdata::{ExportLogsRequest, ExportMetricsRequest, ExportTraceRequest};

pub async fn export_metrics(
    State(state): State<AppState>,
    Json(req): Json<ExportMetricsRequest>,
) -> Result<impl IntoResponse, Error> {
    state.analyzer.consume_metrics(req).await?;
    Ok(Json(json!({ "partialSuccess": {} })))
}

pub async fn export_traces(
    State(state): State<AppState>,
    Json(req): Json<ExportTraceRequest>,
) -> Result<impl IntoResponse, Error> {
    state.analyzer.consume_traces(req).await?;
    Ok(Json(json!({ "partialSuccess": {} })))
}

pub async fn export_logs(
    State(state): State<AppState>,
    Json(req): Json<ExportLogsRequest>,
) -> Result<impl IntoResponse, Error> {
    state.analyzer.consume_logs(req).await?;
    Ok(Json(json!({ "partialSuccess": {} })))
}
