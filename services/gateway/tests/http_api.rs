//! End-to-end HTTP tests against a real `axum::serve` instance, in the
//! style of the teacher's `services/server/tests/http_reads.rs`: bind an
//! ephemeral port, spawn the router, then drive it with `reqwest`.
//!
//! Device sessions are backed by `device_session::sim`'s simulated raw-REPL
//! device rather than real hardware, inserted directly into `AppState` the
//! same way `device_session::connect` would on success.

use std::sync::Arc;

use device_session::sim::spawn_simulated_device;
use event_bus::EventBus;
use gateway::state::AppState;
use serde_json::json;

async fn spawn_server() -> (std::net::SocketAddr, Arc<AppState>) {
    let bus = Arc::new(EventBus::new());
    bus.start();
    let config_path = tempfile::tempdir().unwrap().path().join("config.json");
    let state = AppState::new(bus, repl_proto::AppConfig::default(), config_path);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = gateway::build_router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

#[tokio::test]
async fn healthz_and_readyz_respond_ok() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let healthz = client.get(format!("http://{addr}/healthz")).send().await.unwrap();
    assert_eq!(healthz.status(), 200);
    let readyz = client.get(format!("http://{addr}/readyz")).send().await.unwrap();
    assert_eq!(readyz.status(), 200);
}

#[tokio::test]
async fn unknown_port_returns_404_with_error_body() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/devices/NOPE"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("NOPE"));
}

/// Scenario S1 (connect/execute): a session summary reflects the connected
/// state, and `/repl` round-trips `print(1+2)` to `REPLResult{output:"3\n"}`.
#[tokio::test]
async fn repl_endpoint_executes_and_returns_result() {
    let (addr, state) = spawn_server().await;
    let (session, _device) = spawn_simulated_device(Arc::clone(&state.bus), "SIM0".into());
    state.insert_session(session).await;

    let client = reqwest::Client::new();
    let summary: serde_json::Value = client
        .get(format!("http://{addr}/api/devices/SIM0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["port_id"], "SIM0");
    assert_eq!(summary["state"], "connected");

    let result: repl_proto::ReplResult = client
        .post(format!("http://{addr}/api/devices/SIM0/repl"))
        .json(&json!({ "code": "print(1+2)" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.output.trim(), "3");
}

/// Scenario S3 (file round-trip): write through `/files/write`, list the
/// parent directory, then read the bytes back through `/files/read`.
#[tokio::test]
async fn file_write_list_read_round_trips() {
    let (addr, state) = spawn_server().await;
    let (session, _device) = spawn_simulated_device(Arc::clone(&state.bus), "SIM0".into());
    state.insert_session(session).await;
    let client = reqwest::Client::new();

    let write_response = client
        .post(format!("http://{addr}/api/devices/SIM0/files/write"))
        .json(&json!({ "path": "/data.txt", "content": "hello device" }))
        .send()
        .await
        .unwrap();
    assert_eq!(write_response.status(), 200);

    let listing: Vec<repl_proto::FileEntry> = client
        .get(format!("http://{addr}/api/devices/SIM0/files?path=/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listing.iter().any(|e| e.path == "/data.txt" && e.size == 12));

    let read: serde_json::Value = client
        .get(format!("http://{addr}/api/devices/SIM0/files/read?path=/data.txt"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["binary"], false);
    assert_eq!(read["content"], "hello device");
}

#[tokio::test]
async fn config_patch_persists_and_is_readable() {
    let (addr, state) = spawn_server().await;
    let client = reqwest::Client::new();

    let before: repl_proto::AppConfig = client
        .get(format!("http://{addr}/api/config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before.default_baudrate, 115_200);

    let after: repl_proto::AppConfig = client
        .put(format!("http://{addr}/api/config"))
        .json(&json!({ "default_baudrate": 9600 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after.default_baudrate, 9600);
    assert_eq!(state.config.read().await.default_baudrate, 9600);
    assert!(state.config_path.exists());
}

/// Every bus event mirrors into the buffered activity log exposed at
/// `/api/logs`, the same way the gateway mirrors events to WebSocket clients.
#[tokio::test]
async fn logs_endpoint_reflects_bus_activity() {
    let (addr, state) = spawn_server().await;
    state.bus.emit(
        event_bus::EventKind::AppReady,
        json!({ "detail": "integration test" }),
        None,
    );
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let client = reqwest::Client::new();
    let entries: Vec<String> = client
        .get(format!("http://{addr}/api/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.contains("app:ready") && e.contains("integration test")));
}

#[tokio::test]
async fn options_preflight_gets_permissive_cors_headers() {
    let (addr, _state) = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/api/devices/SIM0/repl"))
        .header("Origin", "http://example.com")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}
