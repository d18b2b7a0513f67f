pub mod devices;
pub mod files;
pub mod health;
pub mod lsp;
pub mod packages;
pub mod settings;
pub mod sync;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::error::GatewayError;
use crate::state::AppState;

/// Shared by every per-device handler: resolve `port` to its open session or
/// fail with 404, matching the REST surface's `{port}` path segment.
pub(crate) async fn require_session(
    state: &AppState,
    port: &str,
) -> Result<Arc<device_session::Session>, GatewayError> {
    state
        .session(port)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("no open session for {port}")))
}

pub async fn options_ok() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
