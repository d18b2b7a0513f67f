//! A minimal stand-in language server used only by integration tests: reads
//! Content-Length framed JSON-RPC 2.0 requests on stdin and answers each
//! with a canned, request-echoing result so a test can assert that the
//! response it receives actually belongs to the request it sent.

use std::io::{self, BufRead, Read, Write};

use serde_json::{json, Value};

fn read_frame(stdin: &mut impl BufRead) -> Option<Value> {
    let mut content_length = None;
    loop {
        let mut line = String::new();
        if stdin.read_line(&mut line).ok()? == 0 {
            return None;
        }
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
    let len = content_length?;
    let mut body = vec![0u8; len];
    stdin.read_exact(&mut body).ok()?;
    serde_json::from_slice(&body).ok()
}

fn write_frame(stdout: &mut impl Write, value: &Value) {
    let body = serde_json::to_vec(value).expect("serializable response");
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let _ = stdout.write_all(header.as_bytes());
    let _ = stdout.write_all(&body);
    let _ = stdout.flush();
}

fn main() {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    while let Some(request) = read_frame(&mut reader) {
        let Some(id) = request.get("id").cloned() else {
            // Notification: nothing to answer, possibly "exit".
            if request.get("method").and_then(Value::as_str) == Some("exit") {
                break;
            }
            continue;
        };
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let result = match method {
            "initialize" => json!({ "capabilities": {} }),
            "shutdown" => Value::Null,
            // Echo the request's own params back inside the result so a
            // concurrent caller can verify it got its own answer, not
            // another in-flight request's.
            _ => json!({ "echoMethod": method, "echoParams": params, "items": [{ "label": "print" }] }),
        };
        write_frame(&mut writer, &json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }
}
