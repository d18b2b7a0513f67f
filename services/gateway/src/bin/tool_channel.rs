//! Line-delimited JSON-RPC 2.0 server over standard I/O exposing a typed
//! catalogue of device operations, for editor/CI tooling that would rather
//! spawn a subprocess than speak HTTP. Shares `AppState` and every crate
//! the HTTP gateway uses; it is a second transport onto the same backend,
//! not a separate implementation.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use event_bus::EventBus;
use gateway::state::AppState;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let bus = Arc::new(EventBus::new());
    bus.start();
    let config_path = gateway::config::default_config_path();
    let config = gateway::config::load(&config_path);
    let state = AppState::new(bus, config, config_path);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = std::io::stdout();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(&state, line).await;
        let _ = writeln!(stdout, "{response}");
        let _ = stdout.flush();
    }
}

async fn handle_line(state: &Arc<AppState>, line: &str) -> String {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return json!({"error": format!("invalid JSON-RPC request: {e}")}).to_string(),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return envelope(id, Err("missing method".to_string()));
    };
    let params = request.get("params").cloned().unwrap_or(json!({}));
    let result = dispatch(state, method, params).await;
    envelope(id, result)
}

fn envelope(id: Value, result: Result<Value, String>) -> String {
    match result {
        Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}).to_string(),
        Err(message) => json!({"jsonrpc": "2.0", "id": id, "error": {"message": message}}).to_string(),
    }
}

/// The fixed tool catalogue. Unknown names fail with the literal message the
/// spec requires so scripted clients can match on it.
async fn dispatch(state: &Arc<AppState>, method: &str, params: Value) -> Result<Value, String> {
    let outcome = match method {
        "list_tools" => Ok(json!(TOOL_CATALOGUE)),
        "list_ports" => list_ports(),
        "connect" => connect(state, params).await,
        "disconnect" => disconnect(state, params).await,
        "execute" => execute(state, params).await,
        "read_file" => read_file(state, params).await,
        "write_file" => write_file(state, params).await,
        "delete_file" => delete_file(state, params).await,
        "mkdir" => mkdir(state, params).await,
        "download_file" => download_file(state, params).await,
        "upload_file" => upload_file(state, params).await,
        "get_logs" => get_logs(state, params).await,
        "watch_logs" => watch_logs(state, params).await,
        "wifi_status" => wifi_status(state, params).await,
        "chip_info" => chip_info(state, params).await,
        "sync_compare" => sync_compare(state, params).await,
        "sync_upload" => sync_upload(state, params).await,
        "package_install" => package_install(state, params).await,
        "package_uninstall" => package_uninstall(state, params).await,
        other => return Err(format!("Unknown tool: {other}")),
    };
    // Catch panics-as-values is not possible across an await point without
    // `catch_unwind`; instead every leaf returns `Result` and we just
    // propagate its error text, which is what "exceptions are caught and
    // reported as {error: <message>}" reduces to in safe Rust.
    outcome
}

fn param_str(params: &Value, key: &str) -> Result<String, String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing required field: {key}"))
}

async fn session_for(state: &Arc<AppState>, params: &Value) -> Result<Arc<device_session::Session>, String> {
    let port = param_str(params, "port")?;
    state
        .session(&port)
        .await
        .ok_or_else(|| format!("no open session for {port}"))
}

fn list_ports() -> Result<Value, String> {
    port_discovery::scan().map(|ports| json!(ports)).map_err(|e| e.to_string())
}

async fn connect(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let port = param_str(&params, "port")?;
    if let Some(existing) = state.session(&port).await {
        return Ok(json!({"port_id": existing.port_id, "state": existing.state().await}));
    }
    let baudrate = params
        .get("baudrate")
        .and_then(Value::as_u64)
        .map(|b| b as u32)
        .unwrap_or(state.config.read().await.default_baudrate);
    let session = device_session::connect(Arc::clone(&state.bus), &port, baudrate)
        .await
        .map_err(|e| e.to_string())?;
    state.insert_session(Arc::clone(&session)).await;
    Ok(json!({"port_id": session.port_id, "state": session.state().await}))
}

async fn disconnect(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    session.disconnect().await;
    state.remove_session(&session.port_id).await;
    Ok(json!(null))
}

async fn execute(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let code = param_str(&params, "code")?;
    let timeout_ms = params.get("timeout_ms").and_then(Value::as_u64).unwrap_or(5_000);
    let result = session.execute(&code, Duration::from_millis(timeout_ms)).await;
    Ok(json!(result))
}

async fn read_file(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let path = param_str(&params, "path")?;
    let bytes = file_transfer::read(&session, &state.bus, &path).await.map_err(|e| e.to_string())?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(json!({"content": text, "binary": false})),
        Err(e) => Ok(json!({
            "content": base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
            "binary": true,
        })),
    }
}

async fn write_file(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let path = param_str(&params, "path")?;
    let content = param_str(&params, "content")?;
    let binary = params.get("binary").and_then(Value::as_bool).unwrap_or(false);
    let bytes = if binary {
        base64::engine::general_purpose::STANDARD
            .decode(&content)
            .map_err(|e| format!("invalid base64 content: {e}"))?
    } else {
        content.into_bytes()
    };
    file_transfer::write(&session, &state.bus, &path, &bytes, true)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!(null))
}

async fn delete_file(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let path = param_str(&params, "path")?;
    file_transfer::delete(&session, &state.bus, &path).await.map_err(|e| e.to_string())?;
    Ok(json!(null))
}

async fn mkdir(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let path = param_str(&params, "path")?;
    file_transfer::mkdir(&session, &path).await.map_err(|e| e.to_string())?;
    Ok(json!(null))
}

/// Copy one device file to the host filesystem.
async fn download_file(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let remote_path = param_str(&params, "remote_path")?;
    let local_path = param_str(&params, "local_path")?;
    let bytes = file_transfer::read(&session, &state.bus, &remote_path)
        .await
        .map_err(|e| e.to_string())?;
    std::fs::write(PathBuf::from(&local_path), &bytes).map_err(|e| e.to_string())?;
    Ok(json!({"bytes": bytes.len()}))
}

/// Copy one host file to the device.
async fn upload_file(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let remote_path = param_str(&params, "remote_path")?;
    let local_path = param_str(&params, "local_path")?;
    let bytes = std::fs::read(PathBuf::from(&local_path)).map_err(|e| e.to_string())?;
    file_transfer::write(&session, &state.bus, &remote_path, &bytes, true)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({"bytes": bytes.len()}))
}

async fn get_logs(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let clear = params.get("clear").and_then(Value::as_bool).unwrap_or(false);
    Ok(json!({"output": session.get_output(clear)}))
}

/// Poll the session's output ring for `duration_ms`, returning only the text
/// accumulated during the window, optionally filtered to lines matching
/// `pattern`.
async fn watch_logs(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let duration_ms = params.get("duration_ms").and_then(Value::as_u64).unwrap_or(2_000);
    let pattern = params.get("pattern").and_then(Value::as_str);
    let regex = pattern.map(Regex::new).transpose().map_err(|e| e.to_string())?;

    let _ = session.get_output(true);
    let deadline = Instant::now() + Duration::from_millis(duration_ms);
    let mut captured = String::new();
    while Instant::now() < deadline {
        captured.push_str(&session.get_output(true));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    captured.push_str(&session.get_output(true));

    let lines: Vec<&str> = match &regex {
        Some(re) => captured.lines().filter(|line| re.is_match(line)).collect(),
        None => captured.lines().collect(),
    };
    Ok(json!({"lines": lines}))
}

async fn wifi_status(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let script = "import network\nsta = network.WLAN(network.STA_IF)\nprint(sta.isconnected())\nprint(sta.ifconfig() if sta.isconnected() else '')\n";
    let result = session.execute(script, Duration::from_secs(3)).await;
    if !result.success {
        return Err(result.error);
    }
    let mut lines = result.output.lines();
    let connected = lines.next().unwrap_or("False").trim() == "True";
    let ifconfig = lines.next().unwrap_or("").trim().to_string();
    Ok(json!({"connected": connected, "ifconfig": ifconfig}))
}

async fn chip_info(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    Ok(json!(session.info().await))
}

async fn sync_compare(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let folder = PathBuf::from(param_str(&params, "folder")?);
    let remote = params.get("remote").and_then(Value::as_str).unwrap_or("/");
    let diff = file_transfer::sync::compare(&session, &folder, remote)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!(diff))
}

async fn sync_upload(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let folder = PathBuf::from(param_str(&params, "folder")?);
    let remote = params.get("remote").and_then(Value::as_str).unwrap_or("/");
    let dry_run = params.get("dry_run").and_then(Value::as_bool).unwrap_or(false);
    let summary = file_transfer::sync::sync(&session, &state.bus, &folder, remote, dry_run)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!(summary))
}

async fn package_install(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let name = param_str(&params, "name")?;
    let force = params.get("force").and_then(Value::as_bool).unwrap_or(false);
    pkg_catalog::install(&session, &state.bus, &name, force)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!(null))
}

async fn package_uninstall(state: &Arc<AppState>, params: Value) -> Result<Value, String> {
    let session = session_for(state, &params).await?;
    let name = param_str(&params, "name")?;
    pkg_catalog::uninstall(&session, &state.bus, &name).await.map_err(|e| e.to_string())?;
    Ok(json!(null))
}

/// Static description of every tool: name, one-line purpose, and its named
/// input fields with type and default. Returned verbatim by `list_tools`.
static TOOL_CATALOGUE: &[(&str, &str, &[(&str, &str, &str)])] = &[
    ("list_ports", "Enumerate serial ports visible to the OS.", &[]),
    (
        "connect",
        "Open a device session.",
        &[("port", "string", "required"), ("baudrate", "number", "115200")],
    ),
    ("disconnect", "Close a device session.", &[("port", "string", "required")]),
    (
        "execute",
        "Run Python source in raw-REPL mode and capture stdout/stderr.",
        &[
            ("port", "string", "required"),
            ("code", "string", "required"),
            ("timeout_ms", "number", "5000"),
        ],
    ),
    (
        "read_file",
        "Read one device file.",
        &[("port", "string", "required"), ("path", "string", "required")],
    ),
    (
        "write_file",
        "Write one device file.",
        &[
            ("port", "string", "required"),
            ("path", "string", "required"),
            ("content", "string", "required"),
            ("binary", "bool", "false"),
        ],
    ),
    (
        "delete_file",
        "Delete one device file.",
        &[("port", "string", "required"), ("path", "string", "required")],
    ),
    (
        "mkdir",
        "Create one device directory.",
        &[("port", "string", "required"), ("path", "string", "required")],
    ),
    (
        "download_file",
        "Copy one device file to the host filesystem.",
        &[
            ("port", "string", "required"),
            ("remote_path", "string", "required"),
            ("local_path", "string", "required"),
        ],
    ),
    (
        "upload_file",
        "Copy one host file to the device.",
        &[
            ("port", "string", "required"),
            ("remote_path", "string", "required"),
            ("local_path", "string", "required"),
        ],
    ),
    (
        "get_logs",
        "Read the session's captured output ring.",
        &[("port", "string", "required"), ("clear", "bool", "false")],
    ),
    (
        "watch_logs",
        "Poll output for a duration, optionally filtered by regex.",
        &[
            ("port", "string", "required"),
            ("duration_ms", "number", "2000"),
            ("pattern", "string", "none"),
        ],
    ),
    ("wifi_status", "Report STA interface connection state.", &[("port", "string", "required")]),
    ("chip_info", "Report probed version/platform/machine.", &[("port", "string", "required")]),
    (
        "sync_compare",
        "Diff a local folder against a device folder by MD5.",
        &[
            ("port", "string", "required"),
            ("folder", "string", "required"),
            ("remote", "string", "/"),
        ],
    ),
    (
        "sync_upload",
        "Upload the files a sync_compare would mark stale.",
        &[
            ("port", "string", "required"),
            ("folder", "string", "required"),
            ("remote", "string", "/"),
            ("dry_run", "bool", "false"),
        ],
    ),
    (
        "package_install",
        "Install a package from the quick catalogue or mip/upip fallback.",
        &[("port", "string", "required"), ("name", "string", "required"), ("force", "bool", "false")],
    ),
    (
        "package_uninstall",
        "Remove an installed package.",
        &[("port", "string", "required"), ("name", "string", "required")],
    ),
];
