//! Language Server Protocol proxy: owns a single child process, frames its
//! standard I/O per the LSP wire format, and correlates requests with
//! responses by a monotonically increasing `id`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use event_bus::{EventBus, EventKind};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CHILD_TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("failed to spawn language server: {0}")]
    Spawn(std::io::Error),
    #[error("language server is not running")]
    NotRunning,
    #[error("request timed out")]
    Timeout,
    #[error("request was cancelled")]
    Cancelled,
    #[error("language server returned an error: {0}")]
    Response(Value),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Framing(String),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Path to the bundled MicroPython type stubs, used as a Jedi `extra_paths`
/// hint so completions understand `machine`/`network`/etc. without the
/// device's actual firmware installed locally. Falls back to the current
/// directory if the installation root can't be determined.
fn stub_path() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.join("stubs")))
        .unwrap_or_else(|| std::path::PathBuf::from("stubs"))
        .to_string_lossy()
        .into_owned()
}

type ResponseSlot = oneshot::Sender<Result<Value, LspError>>;
type PendingMap = Arc<SyncMutex<HashMap<i64, ResponseSlot>>>;

/// One language-server child process and its framed stdio.
pub struct LspSession {
    bus: Arc<EventBus>,
    stdin: Arc<AsyncMutex<ChildStdin>>,
    child: AsyncMutex<Child>,
    pending: PendingMap,
    next_id: AtomicI64,
    reader_task: AsyncMutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl LspSession {
    /// Spawn `command` with `args` as the language server child process and
    /// start its response reader. Does not send `initialize`; callers issue
    /// that separately so a spawn failure and a protocol failure are
    /// distinguishable.
    pub fn spawn(bus: Arc<EventBus>, command: &str, args: &[String]) -> Result<Arc<Self>, LspError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(LspError::Spawn)?;

        let stdin = child.stdin.take().ok_or(LspError::NotRunning)?;
        let stdout = child.stdout.take().ok_or(LspError::NotRunning)?;

        let session = Arc::new(Self {
            bus,
            stdin: Arc::new(AsyncMutex::new(stdin)),
            child: AsyncMutex::new(child),
            pending: Arc::new(SyncMutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            reader_task: AsyncMutex::new(None),
            initialized: AtomicBool::new(false),
        });

        let handle = tokio::spawn(run_reader(Arc::clone(&session), stdout));
        if let Ok(mut guard) = session.reader_task.try_lock() {
            *guard = Some(handle);
        }

        Ok(session)
    }

    /// Whether `initialize` has already completed successfully.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Send `initialize` and, on success, the `initialized` notification.
    /// A second call on an already-initialized session is a no-op that
    /// returns an empty capabilities object.
    pub async fn initialize(self: &Arc<Self>, root_uri: &str) -> Result<Value, LspError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(json!({}));
        }
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "capabilities": {},
            "initializationOptions": {
                "pylsp": { "plugins": { "jedi": { "extra_paths": [stub_path()] } } },
            },
        });
        let result = self.request("initialize", params, INITIALIZE_TIMEOUT).await;
        match &result {
            Ok(_) => {
                let _ = self.notify("initialized", json!({})).await;
                self.bus
                    .emit(EventKind::LspInitialized, json!({ "rootUri": root_uri }), None);
            }
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                self.bus
                    .emit(EventKind::LspError, json!({ "message": e.to_string() }), None);
            }
        }
        result
    }

    pub async fn did_open(&self, uri: &str, language_id: &str, version: i64, text: &str) -> Result<(), LspError> {
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": { "uri": uri, "languageId": language_id, "version": version, "text": text },
            }),
        )
        .await
    }

    pub async fn did_change(&self, uri: &str, version: i64, text: &str) -> Result<(), LspError> {
        self.notify(
            "textDocument/didChange",
            json!({
                "textDocument": { "uri": uri, "version": version },
                "contentChanges": [{ "text": text }],
            }),
        )
        .await
    }

    pub async fn did_close(&self, uri: &str) -> Result<(), LspError> {
        self.notify("textDocument/didClose", json!({ "textDocument": { "uri": uri } }))
            .await
    }

    pub async fn completion(&self, uri: &str, line: u32, character: u32) -> Result<Value, LspError> {
        self.request("textDocument/completion", position_params(uri, line, character), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn hover(&self, uri: &str, line: u32, character: u32) -> Result<Value, LspError> {
        self.request("textDocument/hover", position_params(uri, line, character), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn definition(&self, uri: &str, line: u32, character: u32) -> Result<Value, LspError> {
        self.request("textDocument/definition", position_params(uri, line, character), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn signature_help(&self, uri: &str, line: u32, character: u32) -> Result<Value, LspError> {
        self.request(
            "textDocument/signatureHelp",
            position_params(uri, line, character),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    }

    /// `shutdown` then `exit`, cancel the reader, give the child up to 5s to
    /// exit on its own before SIGKILL, then fail any still-pending requests.
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), LspError> {
        let _ = self.request("shutdown", Value::Null, SHUTDOWN_REQUEST_TIMEOUT).await;
        let _ = self.notify("exit", Value::Null).await;

        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }

        let mut child = self.child.lock().await;
        if tokio::time::timeout(CHILD_TERMINATE_GRACE, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        self.fail_all_pending();
        self.bus.emit(EventKind::LspShutdown, json!({}), None);
        Ok(())
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(e) = write_frame(&self.stdin, &frame).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LspError::Cancelled),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(LspError::Timeout)
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), LspError> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        write_frame(&self.stdin, &frame).await
    }

    async fn dispatch(&self, value: Value) {
        if value.get("method").is_none() {
            if let Some(id) = value.get("id").and_then(Value::as_i64) {
                let slot = self.pending.lock().unwrap().remove(&id);
                if let Some(tx) = slot {
                    let result = match value.get("error") {
                        Some(err) => Err(LspError::Response(err.clone())),
                        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
            }
            return;
        }

        let Some(method) = value.get("method").and_then(Value::as_str) else {
            return;
        };
        match method {
            "textDocument/publishDiagnostics" => {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                self.bus.emit(EventKind::LspDiagnostics, params, None);
            }
            "window/logMessage" => {
                let message = value
                    .get("params")
                    .and_then(|p| p.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                tracing::info!(target: "lsp", "{message}");
            }
            other => tracing::debug!(method = other, "unhandled language server message"),
        }
    }

    fn fail_all_pending(&self) {
        for (_, tx) in self.pending.lock().unwrap().drain() {
            let _ = tx.send(Err(LspError::Cancelled));
        }
    }
}

fn position_params(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character },
    })
}

async fn write_frame(stdin: &Arc<AsyncMutex<ChildStdin>>, value: &Value) -> Result<(), LspError> {
    let body = serde_json::to_vec(value)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut guard = stdin.lock().await;
    guard.write_all(header.as_bytes()).await?;
    guard.write_all(&body).await?;
    guard.flush().await?;
    Ok(())
}

/// Read one header block followed by its body. Header names are matched
/// case-insensitively; any header other than `content-length` is ignored.
/// Returns `Ok(None)` on EOF before a header block starts.
async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Value>, LspError> {
    let mut content_length: Option<usize> = None;
    let mut saw_any_line = false;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return if saw_any_line {
                Err(LspError::Framing("eof mid-headers".into()))
            } else {
                Ok(None)
            };
        }
        saw_any_line = true;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }
    let len = content_length.ok_or_else(|| LspError::Framing("missing Content-Length".into()))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

async fn run_reader(session: Arc<LspSession>, stdout: ChildStdout) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(value)) => session.dispatch(value).await,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "lsp reader terminating");
                break;
            }
        }
    }
    session.fail_all_pending();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_a_well_formed_frame() {
        let (mut client, server) = tokio::io::duplex(1024);
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        client.write_all(header.as_bytes()).await.unwrap();
        client.write_all(body).await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let value = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(value["id"], 1);
    }

    #[tokio::test]
    async fn header_matching_is_case_insensitive() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"content-LENGTH: 2\r\n\r\n{}").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let value = read_frame(&mut reader).await.unwrap();
        assert!(value.is_some());
    }

    #[tokio::test]
    async fn clean_eof_before_any_header_yields_none() {
        let (client, server) = tokio::io::duplex(16);
        drop(client);

        let mut reader = BufReader::new(server);
        let value = read_frame(&mut reader).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn missing_content_length_is_a_framing_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"X-Other: 1\r\n\r\n").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        assert!(matches!(read_frame(&mut reader).await, Err(LspError::Framing(_))));
    }
}
