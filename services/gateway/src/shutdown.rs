//! The ordered shutdown sequence: cancel the event dispatcher, close every
//! open WebSocket, shut down the language server child if one is running,
//! disconnect every device session, then stop the port watcher. Each stage
//! tolerates the previous stage's errors so one slow device never blocks the
//! others from being released.

use std::sync::Arc;

use crate::state::AppState;

pub async fn run(state: Arc<AppState>) {
    state.bus.stop().await;
    tracing::info!("event dispatcher stopped");

    let _ = state.shutdown_tx.send(true);
    tracing::info!("websocket sessions signalled to close");

    if let Some(lsp) = state.lsp.write().await.take() {
        if let Err(e) = lsp.shutdown().await {
            tracing::warn!(error = %e, "language server shutdown reported an error");
        }
    }

    let sessions: Vec<_> = state.sessions.write().await.drain().map(|(_, s)| s).collect();
    for session in sessions {
        session.disconnect().await;
    }
    tracing::info!("all device sessions disconnected");

    if let Some(watcher) = state.port_watcher.write().await.take() {
        watcher.stop().await;
    }
    tracing::info!("port watcher stopped");
}
