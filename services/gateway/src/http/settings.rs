use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::state::AppState;

pub async fn get(State(state): State<Arc<AppState>>) -> Json<repl_proto::AppConfig> {
    Json(state.config.read().await.clone())
}

/// Every field optional: present fields overwrite, absent fields keep their
/// current value. Persisted immediately so a crash right after doesn't lose
/// the change.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigPatch {
    pub default_baudrate: Option<u32>,
    pub serial_timeout_ms: Option<u64>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub window_width: Option<u32>,
    pub window_height: Option<u32>,
    pub lsp_command: Option<String>,
    pub lsp_args: Option<Vec<String>>,
}

pub async fn put(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<ConfigPatch>,
) -> Result<Json<repl_proto::AppConfig>, GatewayError> {
    let merged = {
        let mut config = state.config.write().await;
        if let Some(v) = patch.default_baudrate {
            config.default_baudrate = v;
        }
        if let Some(v) = patch.serial_timeout_ms {
            config.serial_timeout_ms = v;
        }
        if let Some(v) = patch.server_host {
            config.server_host = v;
        }
        if let Some(v) = patch.server_port {
            config.server_port = v;
        }
        if let Some(v) = patch.window_width {
            config.window_width = v;
        }
        if let Some(v) = patch.window_height {
            config.window_height = v;
        }
        if let Some(v) = patch.lsp_command {
            config.lsp_command = v;
        }
        if let Some(v) = patch.lsp_args {
            config.lsp_args = v;
        }
        config.clone()
    };
    crate::config::save(&state.config_path, &merged).map_err(|e| GatewayError::Internal(e.to_string()))?;
    state.bus.emit(event_bus::EventKind::ConfigChanged, serde_json::json!(merged), None);
    Ok(Json(merged))
}
