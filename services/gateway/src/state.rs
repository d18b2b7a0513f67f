use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use device_session::Session;
use event_bus::{Event, EventBus};
use lsp_proto::LspSession;
use port_discovery::PortWatcher;
use repl_proto::AppConfig;
use tokio::sync::{broadcast, watch, RwLock};

/// Everything a request handler or WebSocket task needs. One instance is
/// shared (behind `Arc`) across the whole process.
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub sessions: RwLock<HashMap<String, Arc<Session>>>,
    pub lsp: RwLock<Option<Arc<LspSession>>>,
    pub config: RwLock<AppConfig>,
    pub config_path: PathBuf,
    pub logger: Arc<pulsar_log::UiLogger<String>>,
    /// Every bus event is mirrored here; WebSocket tasks subscribe and
    /// filter locally by their own subscription set.
    pub event_tx: broadcast::Sender<Event>,
    /// Flips to `true` during the ordered shutdown sequence; WebSocket
    /// tasks watch this to close promptly instead of lingering.
    pub shutdown_tx: watch::Sender<bool>,
    pub port_watcher: RwLock<Option<PortWatcher>>,
}

impl AppState {
    pub fn new(bus: Arc<EventBus>, config: AppConfig, config_path: PathBuf) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);
        let (log_tx, _) = broadcast::channel(256);
        let logger = Arc::new(pulsar_log::UiLogger::with_buffer(log_tx, |entry| entry, 500));
        let state = Arc::new(Self {
            bus,
            sessions: RwLock::new(HashMap::new()),
            lsp: RwLock::new(None),
            config: RwLock::new(config),
            config_path,
            logger,
            event_tx,
            shutdown_tx,
            port_watcher: RwLock::new(None),
        });
        state.mirror_bus_to_websockets();
        state.mirror_bus_to_logger();
        state
    }

    fn mirror_bus_to_websockets(self: &Arc<Self>) {
        let tx = self.event_tx.clone();
        self.bus.subscribe_all(move |event: &Event| {
            let _ = tx.send(event.clone());
        });
    }

    /// Feed every bus event into the buffered UI logger as one line, the way
    /// the receiver folds connection-state transitions into its log feed.
    fn mirror_bus_to_logger(self: &Arc<Self>) {
        let logger = Arc::clone(&self.logger);
        self.bus.subscribe_all(move |event: &Event| {
            let source = event.source.as_deref().unwrap_or("-");
            logger.log(format!("{} [{source}] {}", event.kind.topic(), event.payload));
        });
    }

    pub async fn session(&self, port_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(port_id).cloned()
    }

    pub async fn insert_session(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.port_id.clone(), session);
    }

    pub async fn remove_session(&self, port_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(port_id)
    }
}
