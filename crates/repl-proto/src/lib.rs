//! Wire and cross-crate data types shared by the device-control backend:
//! port descriptors, REPL results, file/sync records, the package
//! catalogue's element type, and the HTTP/WebSocket message envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A serial port as reported by enumeration, independent of any open session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub port_id: String,
    pub description: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub is_esp_family: bool,
}

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Information probed from the device immediately after connecting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub version: Option<String>,
    pub platform: Option<String>,
    pub machine: Option<String>,
}

/// Snapshot of a session's public state, as returned by the REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub port_id: String,
    pub state: DeviceState,
    pub baudrate: u32,
    pub info: DeviceInfo,
}

/// The outcome of one raw-REPL `execute` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplResult {
    pub output: String,
    pub error: String,
    pub success: bool,
}

impl ReplResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
            success: true,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
            success: false,
        }
    }
}

/// One entry returned by a device directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// One file considered by a folder-sync comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFile {
    pub local_path: String,
    pub remote_path: String,
    pub local_hash: String,
    pub remote_hash: Option<String>,
    pub needs_upload: bool,
    pub size: u64,
}

/// The result of a folder-sync upload pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub uploaded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
}

/// One file a package installation places on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageFile {
    pub remote_path: String,
    /// `None` means create an empty marker file at `remote_path`.
    pub fetch_url: Option<String>,
}

/// One entry in the quick-install package catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    pub dependencies: Vec<String>,
    pub files: Vec<PackageFile>,
}

/// Persisted, user-editable application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_baudrate: u32,
    pub serial_timeout_ms: u64,
    pub server_host: String,
    pub server_port: u16,
    pub window_width: u32,
    pub window_height: u32,
    /// Executable launched for `lsp:initialize`, e.g. a Python language
    /// server installed alongside this tool.
    pub lsp_command: String,
    pub lsp_args: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_baudrate: 115_200,
            serial_timeout_ms: 1_000,
            server_host: "127.0.0.1".to_string(),
            server_port: 8765,
            window_width: 1200,
            window_height: 800,
            lsp_command: "pylsp".to_string(),
            lsp_args: Vec::new(),
        }
    }
}

/// A uniform error body returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
}

impl ApiErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Messages a WebSocket client may send to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { port: String },
    Unsubscribe { port: String },
    ReplInput { port: String, text: String },
    Ping,
    LspInitialize { root_uri: String },
    LspRequest {
        method: String,
        params: serde_json::Value,
        request_id: u64,
    },
    LspNotification { method: String, params: serde_json::Value },
    LspShutdown,
}

/// Messages the gateway sends to a WebSocket client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong,
    Event {
        topic: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
        source: Option<String>,
    },
    /// The reply to one client `LspRequest`, correlated by `request_id` so a
    /// client with several in-flight requests can match each response to its
    /// awaiter without cross-talk.
    LspResponse {
        request_id: u64,
        method: String,
        result: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl From<&event_bus::Event> for ServerMessage {
    fn from(event: &event_bus::Event) -> Self {
        ServerMessage::Event {
            topic: event.topic(),
            payload: event.payload.clone(),
            timestamp: event.timestamp,
            source: event.source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trips_through_json() {
        let msg = ClientMessage::Subscribe {
            port: "COM3".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"subscribe","port":"COM3"}"#);
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::Subscribe { port } => assert_eq!(port, "COM3"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn server_message_from_event_carries_topic() {
        let event = event_bus::Event::new(
            event_bus::EventKind::DeviceOutput,
            serde_json::json!({"text": "hi"}),
            Some("COM3".to_string()),
        );
        let msg = ServerMessage::from(&event);
        match msg {
            ServerMessage::Event { topic, source, .. } => {
                assert_eq!(topic, "device:output");
                assert_eq!(source.as_deref(), Some("COM3"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn app_config_defaults_match_spec() {
        let config = AppConfig::default();
        assert_eq!(config.default_baudrate, 115_200);
        assert_eq!(config.server_port, 8765);
    }
}
