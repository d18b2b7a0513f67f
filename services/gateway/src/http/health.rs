use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    "ok"
}

pub async fn readyz() -> impl IntoResponse {
    "ok"
}

/// Buffered activity log (device/LSP/package lifecycle events rendered as
/// text), most recent last.
pub async fn logs(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.logger.entries())
}
