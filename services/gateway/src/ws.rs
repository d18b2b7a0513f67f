//! The `/ws` multiplexer: one socket per client, subscribed to the whole
//! event bus and filtered locally by the port(s) the client asked for.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use repl_proto::{ClientMessage, ServerMessage};

use crate::state::AppState;

pub async fn upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run(socket, state))
}

async fn run(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.event_tx.subscribe();
    let mut shutdown = state.shutdown_tx.subscribe();
    let mut subscriptions: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_message) => {
                        if handle_client_message(client_message, &state, &mut subscriptions, &mut sink)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let reply = ServerMessage::Error { message: format!("bad message: {e}") };
                        if send(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            event = events.recv() => {
                let Ok(event) = event else { continue };
                let visible = event.source.is_none()
                    || subscriptions.is_empty()
                    || event.source.as_deref().is_some_and(|s| subscriptions.contains(s));
                if !visible {
                    continue;
                }
                let message = ServerMessage::from(&event);
                if send(&mut sink, &message).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send(
    sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    message: &ServerMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).expect("ServerMessage always serializes");
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn handle_client_message(
    message: ClientMessage,
    state: &Arc<AppState>,
    subscriptions: &mut HashSet<String>,
    sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
) -> Result<(), ()> {
    match message {
        ClientMessage::Subscribe { port } => {
            subscriptions.insert(port);
        }
        ClientMessage::Unsubscribe { port } => {
            subscriptions.remove(&port);
        }
        ClientMessage::ReplInput { port, text } => {
            if let Some(session) = state.session(&port).await {
                let _ = session.write_line(&text).await;
            }
        }
        ClientMessage::Ping => {
            send(sink, &ServerMessage::Pong).await?;
        }
        ClientMessage::LspInitialize { root_uri } => {
            handle_lsp_initialize(state, &root_uri, sink).await?;
        }
        ClientMessage::LspRequest { method, params, request_id } => {
            handle_lsp_request(state, &method, params, request_id, sink).await?;
        }
        ClientMessage::LspNotification { method, params } => {
            handle_lsp_notification(state, &method, params).await;
        }
        ClientMessage::LspShutdown => {
            if let Some(session) = state.lsp.write().await.take() {
                let _ = session.shutdown().await;
            }
        }
    }
    Ok(())
}

async fn handle_lsp_initialize(
    state: &Arc<AppState>,
    root_uri: &str,
    sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
) -> Result<(), ()> {
    let session = {
        let mut lsp = state.lsp.write().await;
        if lsp.is_none() {
            let config = state.config.read().await;
            match lsp_proto::LspSession::spawn(Arc::clone(&state.bus), &config.lsp_command, &config.lsp_args) {
                Ok(spawned) => *lsp = Some(spawned),
                Err(e) => {
                    state
                        .bus
                        .emit(event_bus::EventKind::LspError, serde_json::json!({ "message": e.to_string() }), None);
                    return Ok(());
                }
            }
        }
        Arc::clone(lsp.as_ref().expect("just populated"))
    };
    if let Err(e) = session.initialize(root_uri).await {
        send(sink, &ServerMessage::Error { message: e.to_string() }).await?;
    }
    Ok(())
}

fn extract_position(params: &serde_json::Value) -> Option<(String, u32, u32)> {
    let uri = params.get("uri")?.as_str()?.to_string();
    let line = params.get("line")?.as_u64()? as u32;
    let character = params.get("character")?.as_u64()? as u32;
    Some((uri, line, character))
}

/// Dispatch one client `lsp:request`. The reply always carries the caller's
/// `request_id` so a client with several in-flight requests matches each
/// response to its own awaiter instead of the next reply that happens to
/// arrive (testable property 9).
async fn handle_lsp_request(
    state: &Arc<AppState>,
    method: &str,
    params: serde_json::Value,
    request_id: u64,
    sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
) -> Result<(), ()> {
    let lsp = state.lsp.read().await;
    let Some(session) = lsp.as_ref() else {
        return send(sink, &ServerMessage::Error { message: "language server is not running".to_string() }).await;
    };
    let Some((uri, line, character)) = extract_position(&params) else {
        return send(sink, &ServerMessage::Error { message: "missing uri/line/character".to_string() }).await;
    };
    let result = match method {
        "textDocument/completion" => session.completion(&uri, line, character).await,
        "textDocument/hover" => session.hover(&uri, line, character).await,
        "textDocument/definition" => session.definition(&uri, line, character).await,
        "textDocument/signatureHelp" => session.signature_help(&uri, line, character).await,
        other => return send(sink, &ServerMessage::Error { message: format!("unsupported method: {other}") }).await,
    };
    match result {
        Ok(value) => {
            send(
                sink,
                &ServerMessage::LspResponse {
                    request_id,
                    method: method.to_string(),
                    result: value,
                },
            )
            .await
        }
        Err(e) => send(sink, &ServerMessage::Error { message: e.to_string() }).await,
    }
}

async fn handle_lsp_notification(state: &Arc<AppState>, method: &str, params: serde_json::Value) {
    let lsp = state.lsp.read().await;
    let Some(session) = lsp.as_ref() else { return };
    match method {
        "textDocument/didOpen" => {
            if let (Some(uri), Some(language_id), Some(version), Some(text)) = (
                params.get("uri").and_then(|v| v.as_str()),
                params.get("languageId").and_then(|v| v.as_str()),
                params.get("version").and_then(|v| v.as_i64()),
                params.get("text").and_then(|v| v.as_str()),
            ) {
                let _ = session.did_open(uri, language_id, version, text).await;
            }
        }
        "textDocument/didChange" => {
            if let (Some(uri), Some(version), Some(text)) = (
                params.get("uri").and_then(|v| v.as_str()),
                params.get("version").and_then(|v| v.as_i64()),
                params.get("text").and_then(|v| v.as_str()),
            ) {
                let _ = session.did_change(uri, version, text).await;
            }
        }
        "textDocument/didClose" => {
            if let Some(uri) = params.get("uri").and_then(|v| v.as_str()) {
                let _ = session.did_close(uri).await;
            }
        }
        _ => {}
    }
}
