//! Typed publish/subscribe event bus.
//!
//! A single dispatcher task drains a FIFO queue and invokes per-kind handlers
//! (registration order) followed by global handlers. Handler panics are
//! caught and logged; they never stop delivery to sibling handlers.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The closed set of event kinds this system emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    PortAdded,
    PortRemoved,
    Inventory,
    DeviceConnecting,
    DeviceConnected,
    DeviceDisconnected,
    DeviceError,
    DeviceOutput,
    DeviceReset,
    DeviceInterrupted,
    FileProgress,
    FileUploaded,
    FileDownloaded,
    FileDeleted,
    FirmwareProgress,
    FirmwareComplete,
    FirmwareError,
    WifiScanResult,
    WifiConnected,
    WifiDisconnected,
    LspInitialized,
    LspDiagnostics,
    LspError,
    LspShutdown,
    AppReady,
    AppShutdown,
    ConfigChanged,
    PackageProgress,
}

impl EventKind {
    /// All variants, in declaration order. Used by tests and by anything
    /// that needs to subscribe to the entire closed set explicitly.
    pub const ALL: &'static [EventKind] = &[
        EventKind::PortAdded,
        EventKind::PortRemoved,
        EventKind::Inventory,
        EventKind::DeviceConnecting,
        EventKind::DeviceConnected,
        EventKind::DeviceDisconnected,
        EventKind::DeviceError,
        EventKind::DeviceOutput,
        EventKind::DeviceReset,
        EventKind::DeviceInterrupted,
        EventKind::FileProgress,
        EventKind::FileUploaded,
        EventKind::FileDownloaded,
        EventKind::FileDeleted,
        EventKind::FirmwareProgress,
        EventKind::FirmwareComplete,
        EventKind::FirmwareError,
        EventKind::WifiScanResult,
        EventKind::WifiConnected,
        EventKind::WifiDisconnected,
        EventKind::LspInitialized,
        EventKind::LspDiagnostics,
        EventKind::LspError,
        EventKind::LspShutdown,
        EventKind::AppReady,
        EventKind::AppShutdown,
        EventKind::ConfigChanged,
        EventKind::PackageProgress,
    ];

    /// The screaming-snake internal name, e.g. "DEVICE_OUTPUT".
    fn internal_name(self) -> &'static str {
        match self {
            EventKind::PortAdded => "PORT_ADDED",
            EventKind::PortRemoved => "PORT_REMOVED",
            EventKind::Inventory => "INVENTORY",
            EventKind::DeviceConnecting => "DEVICE_CONNECTING",
            EventKind::DeviceConnected => "DEVICE_CONNECTED",
            EventKind::DeviceDisconnected => "DEVICE_DISCONNECTED",
            EventKind::DeviceError => "DEVICE_ERROR",
            EventKind::DeviceOutput => "DEVICE_OUTPUT",
            EventKind::DeviceReset => "DEVICE_RESET",
            EventKind::DeviceInterrupted => "DEVICE_INTERRUPTED",
            EventKind::FileProgress => "FILE_PROGRESS",
            EventKind::FileUploaded => "FILE_UPLOADED",
            EventKind::FileDownloaded => "FILE_DOWNLOADED",
            EventKind::FileDeleted => "FILE_DELETED",
            EventKind::FirmwareProgress => "FIRMWARE_PROGRESS",
            EventKind::FirmwareComplete => "FIRMWARE_COMPLETE",
            EventKind::FirmwareError => "FIRMWARE_ERROR",
            EventKind::WifiScanResult => "WIFI_SCAN_RESULT",
            EventKind::WifiConnected => "WIFI_CONNECTED",
            EventKind::WifiDisconnected => "WIFI_DISCONNECTED",
            EventKind::LspInitialized => "LSP_INITIALIZED",
            EventKind::LspDiagnostics => "LSP_DIAGNOSTICS",
            EventKind::LspError => "LSP_ERROR",
            EventKind::LspShutdown => "LSP_SHUTDOWN",
            EventKind::AppReady => "APP_READY",
            EventKind::AppShutdown => "APP_SHUTDOWN",
            EventKind::ConfigChanged => "CONFIG_CHANGED",
            EventKind::PackageProgress => "PACKAGE_PROGRESS",
        }
    }

    /// The wire topic used on HTTP/WebSocket, e.g. "device:output".
    ///
    /// Derived by lowercasing the internal name and replacing the first
    /// underscore with a colon. Total over the closed enum.
    pub fn topic(self) -> String {
        let name = self.internal_name().to_ascii_lowercase();
        match name.find('_') {
            Some(idx) => format!("{}:{}", &name[..idx], &name[idx + 1..]),
            None => name,
        }
    }
}

/// A single event flowing through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Originating port id, or `None` for events with no single device source.
    pub source: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value, source: Option<String>) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            source,
        }
    }

    /// The topic string this event carries on the wire.
    pub fn topic(&self) -> String {
        self.kind.topic()
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Handlers {
    by_kind: HashMap<EventKind, Vec<(u64, Handler)>>,
    global: Vec<(u64, Handler)>,
}

impl Handlers {
    fn new() -> Self {
        Self {
            by_kind: HashMap::new(),
            global: Vec::new(),
        }
    }
}

/// A subscription-cancellation token. Dropping it does nothing; call
/// [`EventBus::unsubscribe`] explicitly.
pub struct Subscription {
    id: u64,
    kind: Option<EventKind>,
}

/// Closed-enumeration publish/subscribe bus backed by a single dispatcher task.
pub struct EventBus {
    queue_tx: mpsc::UnboundedSender<Event>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    handlers: Arc<Mutex<Handlers>>,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            handlers: Arc::new(Mutex::new(Handlers::new())),
            next_id: AtomicU64::new(1),
            dispatcher: Mutex::new(None),
        }
    }

    /// Subscribe to one event kind. Handlers run in registration order,
    /// before any global handler registered via [`Self::subscribe_all`].
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.lock().expect("event bus handlers poisoned");
        handlers
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            kind: Some(kind),
        }
    }

    /// Subscribe to every event kind. Runs after all kind-specific handlers.
    pub fn subscribe_all(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.lock().expect("event bus handlers poisoned");
        handlers.global.push((id, Arc::new(handler)));
        Subscription { id, kind: None }
    }

    pub fn unsubscribe(&self, sub: Subscription) {
        let mut handlers = self.handlers.lock().expect("event bus handlers poisoned");
        match sub.kind {
            Some(kind) => {
                if let Some(list) = handlers.by_kind.get_mut(&kind) {
                    list.retain(|(id, _)| *id != sub.id);
                }
            }
            None => handlers.global.retain(|(id, _)| *id != sub.id),
        }
    }

    /// Enqueue an event for asynchronous dispatch. Never blocks.
    pub fn emit(&self, kind: EventKind, payload: serde_json::Value, source: Option<String>) {
        self.publish(Event::new(kind, payload, source));
    }

    pub fn publish(&self, event: Event) {
        // The receiver only goes away once `stop()` has dropped it; a send
        // error past that point is expected and not a bug.
        let _ = self.queue_tx.send(event);
    }

    /// Start the dispatcher task. Idempotent: calling `start` twice without
    /// an intervening `stop` is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut dispatcher = self.dispatcher.lock().expect("dispatcher lock poisoned");
        if dispatcher.is_some() {
            return;
        }
        let mut queue_rx = self
            .queue_rx
            .lock()
            .expect("queue lock poisoned")
            .take()
            .expect("event bus queue receiver already taken");
        let handlers = Arc::clone(&self.handlers);
        let handle = tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                dispatch(&handlers, &event);
            }
        });
        *dispatcher = Some(handle);
    }

    /// Stop the dispatcher task and drain no further events.
    pub async fn stop(&self) {
        let handle = self
            .dispatcher
            .lock()
            .expect("dispatcher lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

fn dispatch(handlers: &Arc<Mutex<Handlers>>, event: &Event) {
    let (kind_handlers, global_handlers) = {
        let handlers = handlers.lock().expect("event bus handlers poisoned");
        let kind_handlers: Vec<Handler> = handlers
            .by_kind
            .get(&event.kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        let global_handlers: Vec<Handler> =
            handlers.global.iter().map(|(_, h)| Arc::clone(h)).collect();
        (kind_handlers, global_handlers)
    };
    for handler in kind_handlers.iter().chain(global_handlers.iter()) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
        if let Err(panic) = result {
            tracing::warn!(kind = ?event.kind, "event handler panicked: {:?}", panic_message(&panic));
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn topic_derivation_splits_on_first_underscore() {
        assert_eq!(EventKind::DeviceOutput.topic(), "device:output");
        assert_eq!(EventKind::LspDiagnostics.topic(), "lsp:diagnostics");
        assert_eq!(EventKind::PackageProgress.topic(), "package:progress");
        assert_eq!(EventKind::Inventory.topic(), "inventory");
    }

    #[test]
    fn topic_is_total_over_all_kinds() {
        for kind in EventKind::ALL {
            let topic = kind.topic();
            assert!(!topic.is_empty());
        }
    }

    #[tokio::test]
    async fn kind_handlers_run_before_global_handlers() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        bus.subscribe(EventKind::DeviceOutput, move |_| {
            o1.lock().unwrap().push("kind");
        });
        let o2 = Arc::clone(&order);
        bus.subscribe_all(move |_| {
            o2.lock().unwrap().push("global");
        });
        bus.emit(EventKind::DeviceOutput, serde_json::json!({}), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec!["kind", "global"]);
    }

    #[tokio::test]
    async fn events_from_one_source_arrive_in_order() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        bus.subscribe_all(move |event| {
            if let Some(n) = event.payload.get("n").and_then(|v| v.as_u64()) {
                seen2.lock().unwrap().push(n);
            }
        });
        for n in 0..20u64 {
            bus.emit(
                EventKind::DeviceOutput,
                serde_json::json!({ "n": n }),
                Some("COM1".into()),
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn handler_panic_does_not_stop_sibling_delivery() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe_all(|_| panic!("boom"));
        let hits2 = Arc::clone(&hits);
        bus.subscribe_all(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EventKind::AppReady, serde_json::json!(null), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let sub = bus.subscribe(EventKind::AppReady, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EventKind::AppReady, serde_json::json!(null), None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        bus.unsubscribe(sub);
        bus.emit(EventKind::AppReady, serde_json::json!(null), None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
