use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::state::AppState;

use super::require_session;

pub async fn list_ports() -> Result<Json<Vec<repl_proto::PortDescriptor>>, GatewayError> {
    port_discovery::scan()
        .map(Json)
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

async fn summarize(session: &Arc<device_session::Session>) -> repl_proto::SessionSummary {
    repl_proto::SessionSummary {
        port_id: session.port_id.clone(),
        state: session.state().await,
        baudrate: session.baudrate,
        info: session.info().await,
    }
}

pub async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<repl_proto::SessionSummary>> {
    let sessions = state.sessions.read().await;
    let mut out = Vec::with_capacity(sessions.len());
    for session in sessions.values() {
        out.push(summarize(session).await);
    }
    Json(out)
}

pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
) -> Result<Json<repl_proto::SessionSummary>, GatewayError> {
    let session = require_session(&state, &port).await?;
    Ok(Json(summarize(&session).await))
}

#[derive(Debug, Deserialize, Default)]
pub struct ConnectBody {
    pub baudrate: Option<u32>,
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    body: Option<Json<ConnectBody>>,
) -> Result<Json<repl_proto::SessionSummary>, GatewayError> {
    if let Some(existing) = state.session(&port).await {
        return Ok(Json(summarize(&existing).await));
    }
    let baudrate = body
        .and_then(|Json(b)| b.baudrate)
        .unwrap_or(state.config.read().await.default_baudrate);
    let session = device_session::connect(Arc::clone(&state.bus), &port, baudrate)
        .await
        .map_err(GatewayError::from)?;
    state.insert_session(Arc::clone(&session)).await;
    Ok(Json(summarize(&session).await))
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
) -> Result<(), GatewayError> {
    let session = require_session(&state, &port).await?;
    session.disconnect().await;
    state.remove_session(&port).await;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ResetBody {
    #[serde(default = "default_soft")]
    pub soft: bool,
}

fn default_soft() -> bool {
    true
}

pub async fn reset(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    body: Option<Json<ResetBody>>,
) -> Result<(), GatewayError> {
    let session = require_session(&state, &port).await?;
    let soft = body.map(|Json(b)| b.soft).unwrap_or(true);
    session.reset(soft).await.map_err(GatewayError::from)
}

pub async fn interrupt(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
) -> Result<(), GatewayError> {
    let session = require_session(&state, &port).await?;
    session.interrupt().await.map_err(GatewayError::from)
}

#[derive(Debug, Deserialize)]
pub struct ReplBody {
    pub code: String,
    pub timeout_ms: Option<u64>,
}

pub async fn repl(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    Json(body): Json<ReplBody>,
) -> Result<Json<repl_proto::ReplResult>, GatewayError> {
    let session = require_session(&state, &port).await?;
    let timeout = Duration::from_millis(body.timeout_ms.unwrap_or(5_000));
    Ok(Json(session.execute(&body.code, timeout).await))
}
