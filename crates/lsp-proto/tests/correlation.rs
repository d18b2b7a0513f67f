//! Exercises `LspSession` against a real child process (the fake language
//! server in `src/bin/fake_lsp_server.rs`) rather than a simulated pipe, to
//! cover the spawn/initialize/shutdown lifecycle end to end as well as
//! request/response correlation under concurrency.

use std::sync::Arc;

use event_bus::EventBus;
use lsp_proto::LspSession;

fn spawn_fake_server() -> Arc<LspSession> {
    let bus = Arc::new(EventBus::new());
    bus.start();
    LspSession::spawn(bus, env!("CARGO_BIN_EXE_fake-lsp-server"), &[]).expect("spawn fake server")
}

#[tokio::test]
async fn initialize_then_completion_round_trips() {
    let session = spawn_fake_server();
    let caps = session.initialize("file:///tmp/project").await.unwrap();
    assert!(caps.get("capabilities").is_some());
    assert!(session.is_initialized());

    let result = session.completion("file:///tmp/project/main.py", 0, 7).await.unwrap();
    assert_eq!(result["items"][0]["label"], "print");

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_initialize_is_a_no_op() {
    let session = spawn_fake_server();
    session.initialize("file:///tmp/a").await.unwrap();
    let second = session.initialize("file:///tmp/a").await.unwrap();
    assert_eq!(second, serde_json::json!({}));
    session.shutdown().await.unwrap();
}

/// Property 9: interleaved concurrent requests each observe only the
/// response matching their own id, with no cross-talk.
#[tokio::test]
async fn concurrent_requests_never_cross_talk() {
    let session = spawn_fake_server();
    session.initialize("file:///tmp/project").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20u32 {
        let session = Arc::clone(&session);
        handles.push(tokio::spawn(async move {
            let uri = format!("file:///tmp/project/file{i}.py");
            let result = session.completion(&uri, i, i * 2).await.unwrap();
            (i, uri, result)
        }));
    }

    for handle in handles {
        let (i, uri, result) = handle.await.unwrap();
        assert_eq!(result["echoParams"]["textDocument"]["uri"], uri);
        assert_eq!(result["echoParams"]["position"]["line"], i);
        assert_eq!(result["echoParams"]["position"]["character"], i * 2);
    }

    session.shutdown().await.unwrap();
}
