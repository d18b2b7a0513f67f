use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use repl_proto::ApiErrorBody;

/// Uniform failure type for every HTTP handler. Each variant carries its own
/// status code so handlers just `?` their way through and this does the
/// mapping to `{error: <message>}` once, at the edge.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("language server error: {0}")]
    Lsp(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Device(_) | GatewayError::Lsp(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ApiErrorBody::new(self.to_string()))).into_response()
    }
}

impl From<device_session::SessionError> for GatewayError {
    fn from(e: device_session::SessionError) -> Self {
        GatewayError::Device(e.to_string())
    }
}

impl From<file_transfer::FileTransferError> for GatewayError {
    fn from(e: file_transfer::FileTransferError) -> Self {
        match e {
            file_transfer::FileTransferError::NotFound(path) => GatewayError::NotFound(path),
            other => GatewayError::Device(other.to_string()),
        }
    }
}

impl From<pkg_catalog::PkgError> for GatewayError {
    fn from(e: pkg_catalog::PkgError) -> Self {
        GatewayError::Device(e.to_string())
    }
}

impl From<lsp_proto::LspError> for GatewayError {
    fn from(e: lsp_proto::LspError) -> Self {
        GatewayError::Lsp(e.to_string())
    }
}
