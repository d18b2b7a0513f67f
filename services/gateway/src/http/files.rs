use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::state::AppState;

use super::require_session;

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<repl_proto::FileEntry>>, GatewayError> {
    let session = require_session(&state, &port).await?;
    let entries = file_transfer::list(&session, &query.path).await?;
    Ok(Json(entries))
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub content: String,
    pub binary: bool,
}

pub async fn read(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<Json<ReadResponse>, GatewayError> {
    let session = require_session(&state, &port).await?;
    let bytes = file_transfer::read(&session, &state.bus, &query.path).await?;
    Ok(Json(encode_read_response(bytes)))
}

fn encode_read_response(bytes: Vec<u8>) -> ReadResponse {
    match String::from_utf8(bytes) {
        Ok(text) => ReadResponse {
            content: text,
            binary: false,
        },
        Err(e) => ReadResponse {
            content: base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
            binary: true,
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub binary: bool,
}

pub async fn write(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Json(body): Json<WriteBody>,
) -> Result<(), GatewayError> {
    let session = require_session(&state, &port).await?;
    let bytes = if body.binary {
        base64::engine::general_purpose::STANDARD
            .decode(&body.content)
            .map_err(|e| GatewayError::BadRequest(format!("invalid base64 content: {e}")))?
    } else {
        body.content.into_bytes()
    };
    file_transfer::write(&session, &state.bus, &body.path, &bytes, true).await?;
    Ok(())
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<(), GatewayError> {
    let session = require_session(&state, &port).await?;
    file_transfer::delete(&session, &state.bus, &query.path).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct MkdirBody {
    pub path: String,
}

pub async fn mkdir(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Json(body): Json<MkdirBody>,
) -> Result<(), GatewayError> {
    let session = require_session(&state, &port).await?;
    file_transfer::mkdir(&session, &body.path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_bytes_decode_as_text() {
        let response = encode_read_response(b"hello".to_vec());
        assert!(!response.binary);
        assert_eq!(response.content, "hello");
    }

    #[test]
    fn non_utf8_bytes_are_base64_encoded() {
        let response = encode_read_response(vec![0xff, 0x00, 0xfe]);
        assert!(response.binary);
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(&response.content)
                .unwrap(),
            vec![0xff, 0x00, 0xfe]
        );
    }
}
