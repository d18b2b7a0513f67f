use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::state::AppState;

use super::require_session;

#[derive(Debug, Deserialize)]
pub struct InstallBody {
    pub name: String,
    #[serde(default)]
    pub force: bool,
}

pub async fn install(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Json(body): Json<InstallBody>,
) -> Result<(), GatewayError> {
    let session = require_session(&state, &port).await?;
    pkg_catalog::install(&session, &state.bus, &body.name, body.force).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct UninstallBody {
    pub name: String,
}

pub async fn uninstall(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Json(body): Json<UninstallBody>,
) -> Result<(), GatewayError> {
    let session = require_session(&state, &port).await?;
    pkg_catalog::uninstall(&session, &state.bus, &body.name).await?;
    Ok(())
}
