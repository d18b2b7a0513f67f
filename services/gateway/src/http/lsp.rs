use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct LspStatus {
    pub running: bool,
    pub initialized: bool,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<LspStatus> {
    let lsp = state.lsp.read().await;
    Json(LspStatus {
        running: lsp.is_some(),
        initialized: lsp.as_ref().map(|s| s.is_initialized()).unwrap_or(false),
    })
}

#[derive(Debug, Deserialize)]
pub struct InitializeBody {
    pub root_uri: String,
}

/// Spawn the child on demand (if not already running) and send `initialize`.
pub async fn initialize(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitializeBody>,
) -> Result<Json<Value>, GatewayError> {
    let session = {
        let mut lsp = state.lsp.write().await;
        if lsp.is_none() {
            let config = state.config.read().await;
            let spawned = lsp_proto::LspSession::spawn(Arc::clone(&state.bus), &config.lsp_command, &config.lsp_args)
                .map_err(GatewayError::from)?;
            *lsp = Some(spawned);
        }
        Arc::clone(lsp.as_ref().expect("just populated"))
    };
    let result = session.initialize(&body.root_uri).await?;
    Ok(Json(result))
}

fn require_lsp<'a>(lsp: &'a Option<Arc<lsp_proto::LspSession>>) -> Result<&'a Arc<lsp_proto::LspSession>, GatewayError> {
    lsp.as_ref()
        .ok_or_else(|| GatewayError::BadRequest("language server is not running".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct DidOpenBody {
    pub uri: String,
    pub language_id: String,
    pub version: i64,
    pub text: String,
}

pub async fn did_open(State(state): State<Arc<AppState>>, Json(body): Json<DidOpenBody>) -> Result<(), GatewayError> {
    let lsp = state.lsp.read().await;
    require_lsp(&lsp)?
        .did_open(&body.uri, &body.language_id, body.version, &body.text)
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct DidChangeBody {
    pub uri: String,
    pub version: i64,
    pub text: String,
}

pub async fn did_change(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DidChangeBody>,
) -> Result<(), GatewayError> {
    let lsp = state.lsp.read().await;
    require_lsp(&lsp)?.did_change(&body.uri, body.version, &body.text).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct DidCloseBody {
    pub uri: String,
}

pub async fn did_close(State(state): State<Arc<AppState>>, Json(body): Json<DidCloseBody>) -> Result<(), GatewayError> {
    let lsp = state.lsp.read().await;
    require_lsp(&lsp)?.did_close(&body.uri).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct PositionBody {
    pub uri: String,
    pub line: u32,
    pub character: u32,
}

pub async fn completion(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PositionBody>,
) -> Result<Json<Value>, GatewayError> {
    let lsp = state.lsp.read().await;
    Ok(Json(
        require_lsp(&lsp)?.completion(&body.uri, body.line, body.character).await?,
    ))
}

pub async fn hover(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PositionBody>,
) -> Result<Json<Value>, GatewayError> {
    let lsp = state.lsp.read().await;
    Ok(Json(
        require_lsp(&lsp)?.hover(&body.uri, body.line, body.character).await?,
    ))
}

pub async fn definition(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PositionBody>,
) -> Result<Json<Value>, GatewayError> {
    let lsp = state.lsp.read().await;
    Ok(Json(
        require_lsp(&lsp)?.definition(&body.uri, body.line, body.character).await?,
    ))
}

pub async fn signature(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PositionBody>,
) -> Result<Json<Value>, GatewayError> {
    let lsp = state.lsp.read().await;
    Ok(Json(
        require_lsp(&lsp)?
            .signature_help(&body.uri, body.line, body.character)
            .await?,
    ))
}

pub async fn shutdown(State(state): State<Arc<AppState>>) -> Result<(), GatewayError> {
    let session = state.lsp.write().await.take();
    if let Some(session) = session {
        session.shutdown().await?;
    }
    Ok(())
}
