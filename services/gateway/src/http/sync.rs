use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::state::AppState;

use super::require_session;

#[derive(Debug, Deserialize)]
pub struct CompareBody {
    pub folder: PathBuf,
    pub remote: Option<String>,
}

pub async fn compare(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Json(body): Json<CompareBody>,
) -> Result<Json<Vec<repl_proto::SyncFile>>, GatewayError> {
    let session = require_session(&state, &port).await?;
    let remote = body.remote.as_deref().unwrap_or("/");
    let diff = file_transfer::sync::compare(&session, &body.folder, remote).await?;
    Ok(Json(diff))
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    pub folder: PathBuf,
    pub remote: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Json(body): Json<UploadBody>,
) -> Result<Json<repl_proto::SyncSummary>, GatewayError> {
    let session = require_session(&state, &port).await?;
    let remote = body.remote.as_deref().unwrap_or("/");
    let summary = file_transfer::sync::sync(&session, &state.bus, &body.folder, remote, body.dry_run).await?;
    Ok(Json(summary))
}
