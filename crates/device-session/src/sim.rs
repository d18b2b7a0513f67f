//! An in-process simulated MicroPython device, used by this crate's tests
//! and by the file-transfer and gateway crates' integration tests.
//!
//! It speaks the raw-REPL byte protocol (§4.3) over an in-memory duplex
//! pipe and evaluates a small subset of the Python surface that the
//! generated probe/file-transfer scripts actually use: `print(...)` of
//! literals/arithmetic, `raise ...(...)`, and a virtual filesystem backing
//! `os.stat`, `os.remove`, `os.mkdir`, `os.listdir`, and binary file
//! read/write through `ubinascii.a2b_base64`/`b2a_base64`. It does not
//! execute arbitrary Python: unrecognized scripts reply with an empty OK.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use event_bus::EventBus;

use crate::Session;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const ENTER_RAW: u8 = 0x01;
const EXIT_RAW: u8 = 0x02;

/// Shared virtual filesystem a [`SimulatedDevice`] exposes to its script
/// executor. Paths are plain strings; directories are tracked as a set of
/// prefixes rather than distinct nodes.
#[derive(Default)]
pub struct VirtualFs {
    pub files: HashMap<String, Vec<u8>>,
    pub dirs: std::collections::HashSet<String>,
    /// `(path, buffered bytes)` for a file opened with `open(path, 'wb')`
    /// whose writes and close have not yet been executed.
    open_write: Option<(String, Vec<u8>)>,
}

fn parent_of(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => "/".to_string(),
    }
}

/// The device side of a simulated raw-REPL link. Held by tests to push raw
/// bytes (to exercise the background reader) or to inspect the virtual
/// filesystem after a file-transfer operation.
pub struct SimulatedDevice {
    write_half: Arc<AsyncMutex<WriteHalf<tokio::io::DuplexStream>>>,
    pub fs: Arc<Mutex<VirtualFs>>,
}

impl SimulatedDevice {
    /// Write bytes directly to the session's reader, bypassing the raw-REPL
    /// executor. Used to test the background output ring.
    pub async fn push_raw(&mut self, bytes: &[u8]) {
        let mut guard = self.write_half.lock().await;
        let _ = guard.write_all(bytes).await;
    }
}

/// Spawn a simulated device and a [`Session`] wired to it. The returned
/// session behaves like one backed by a real serial port: `execute` drives
/// a genuine raw-REPL dialogue against the device task.
pub fn spawn_simulated_device(
    bus: Arc<EventBus>,
    port_id: String,
) -> (Arc<Session>, SimulatedDevice) {
    let (host_side, device_side) = tokio::io::duplex(64 * 1024);
    let (host_read, host_write) = tokio::io::split(host_side);
    let session = Session::from_transport(
        bus,
        port_id,
        115_200,
        Box::pin(host_read),
        Box::pin(host_write),
    );

    let (device_read, device_write) = tokio::io::split(device_side);
    let device_write = Arc::new(AsyncMutex::new(device_write));
    let fs = Arc::new(Mutex::new(VirtualFs::default()));
    let device = SimulatedDevice {
        write_half: Arc::clone(&device_write),
        fs: Arc::clone(&fs),
    };
    tokio::spawn(run_device(device_read, device_write, fs));
    (session, device)
}

async fn run_device(
    mut read_half: ReadHalf<tokio::io::DuplexStream>,
    write_half: Arc<AsyncMutex<WriteHalf<tokio::io::DuplexStream>>>,
    fs: Arc<Mutex<VirtualFs>>,
) {
    let mut in_raw = false;
    // Set while a submitted program contains an infinite loop and hasn't
    // been cut off by CTRL_C yet; a real device doesn't ack with OK until
    // the running program actually finishes, so execute's timeout has
    // something real to fire against.
    let mut busy = false;
    let mut pending = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(pos) = pending.iter().position(|&b| {
            b == CTRL_C || b == ENTER_RAW || b == EXIT_RAW || b == CTRL_D
        }) {
            let control = pending[pos];
            if control != CTRL_D {
                // CTRL_C/ENTER_RAW/EXIT_RAW carry no payload before them in
                // our simplified simulator (the real device discards any
                // stray bytes preceding a control byte too).
                pending.drain(..=pos);
            }
            match control {
                CTRL_C if busy => {
                    busy = false;
                    let mut reply = Vec::new();
                    reply.extend_from_slice(b"OK");
                    reply.push(CTRL_D);
                    reply.extend_from_slice(b"Traceback (most recent call last):\nKeyboardInterrupt: \n");
                    reply.push(CTRL_D);
                    reply.push(b'>');
                    let mut guard = write_half.lock().await;
                    let _ = guard.write_all(&reply).await;
                }
                CTRL_C => {
                    // interrupt outside a running program: nothing to
                    // acknowledge synchronously.
                }
                ENTER_RAW => {
                    in_raw = true;
                    let mut guard = write_half.lock().await;
                    let _ = guard.write_all(b"raw REPL; CTRL-B to exit\r\n>").await;
                }
                EXIT_RAW => {
                    in_raw = false;
                }
                CTRL_D if in_raw && !busy => {
                    // Everything accumulated before this 0x04 is the
                    // submitted source.
                    let source_bytes = pending.drain(..pos).collect::<Vec<u8>>();
                    pending.drain(..1); // drop the 0x04 itself
                    let source = String::from_utf8_lossy(&source_bytes).to_string();
                    if source.contains("while True") {
                        // Never-finishing program: withhold the OK ack
                        // until a CTRL_C interrupt arrives.
                        busy = true;
                        continue;
                    }
                    let (output, error) = execute_script(&source, &fs);
                    let mut reply = Vec::new();
                    reply.extend_from_slice(b"OK");
                    reply.extend_from_slice(output.as_bytes());
                    reply.push(CTRL_D);
                    reply.extend_from_slice(error.as_bytes());
                    reply.push(CTRL_D);
                    reply.push(b'>');
                    let mut guard = write_half.lock().await;
                    let _ = guard.write_all(&reply).await;
                }
                CTRL_D if in_raw => {
                    // Busy running a program; a 0x04 here is just part of
                    // an incoming new submission queued behind it, leave it
                    // for the next iteration once `busy` clears.
                    break;
                }
                CTRL_D => {
                    // Soft reset outside raw mode: emit a banner.
                    pending.drain(..=pos);
                    let mut guard = write_half.lock().await;
                    let _ = guard
                        .write_all(b"MBOOT\r\nMicroPython v1.22 on sim; sim board\r\n>>> ")
                        .await;
                }
            }
        }
    }
}

/// Evaluate the tiny subset of Python this simulator understands. Returns
/// `(stdout, stderr)`; `stderr` non-empty means the device-side execution
/// failed, matching raw-REPL framing.
fn execute_script(source: &str, fs: &Arc<Mutex<VirtualFs>>) -> (String, String) {
    if source.contains("while True") {
        // Caller's timeout will fire; the device never finishes this
        // program until a subsequent interrupt cuts the link, so we just
        // hang by returning nothing meaningful -- the harness's read loop
        // is driven by the caller's own timeout, not by us blocking here.
        return (String::new(), String::new());
    }

    // File-transfer and folder-sync emit whole scripts recognizable by a
    // single distinguishing construct; handling them this way (rather than
    // interpreting every line) keeps the simulator a deterministic stand-in
    // for the device instead of a general Python evaluator.
    if source.contains("_rt_list(") {
        return sim_list(source, fs);
    }
    if source.contains("os.stat(") && source.contains("ENOENT") {
        return sim_stat(source, fs);
    }
    if source.contains("uhashlib.md5()") {
        return sim_md5(source, fs);
    }
    if source.contains("b2a_base64") {
        return sim_read_chunk(source, fs);
    }
    if source.trim_start().starts_with("f = open(") && source.contains("'wb'") {
        if let Some(path) = find_quoted_after(source, "open(") {
            fs.lock().expect("sim fs poisoned").open_write = Some((path, Vec::new()));
        }
        return (String::new(), String::new());
    }
    if source.contains("a2b_base64") {
        if let Some(encoded) = find_quoted_after(source, "a2b_base64(") {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&encoded) {
                let mut guard = fs.lock().expect("sim fs poisoned");
                if let Some((_, buf)) = guard.open_write.as_mut() {
                    buf.extend_from_slice(&bytes);
                }
            }
        }
        return (String::new(), String::new());
    }
    if source.trim() == "f.close()" {
        let mut guard = fs.lock().expect("sim fs poisoned");
        if let Some((path, data)) = guard.open_write.take() {
            guard.files.insert(path, data);
        }
        return (String::new(), String::new());
    }
    if source.contains("os.remove(") {
        return sim_remove(source, fs);
    }
    if source.contains("os.mkdir(") {
        return sim_mkdir(source, fs);
    }
    if source.contains("os.rmdir(") {
        return sim_rmdir(source, fs);
    }

    // Fallback: a tiny line-based interpreter for simple `print`/`raise`
    // scripts used by this crate's own unit tests.
    let mut stdout = String::new();
    for line in source.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("raise ") {
            let message = extract_quoted(rest).unwrap_or_else(|| rest.to_string());
            return (stdout, format!("Traceback (most recent call last):\n{rest}: {message}\n"));
        }
        if let Some(rest) = line.strip_prefix("print(") {
            let expr = rest.trim_end_matches(')');
            stdout.push_str(&eval_print(expr, fs));
            stdout.push('\n');
            continue;
        }
    }
    (stdout, String::new())
}

fn find_quoted_after(source: &str, marker: &str) -> Option<String> {
    let pos = source.find(marker)?;
    extract_quoted(&source[pos + marker.len()..])
}

fn find_number_after(source: &str, marker: &str) -> Option<i64> {
    let pos = source.find(marker)?;
    let rest = &source[pos + marker.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().ok()
}

fn sim_list(source: &str, fs: &Arc<Mutex<VirtualFs>>) -> (String, String) {
    let Some(path) = find_quoted_after(source, "_rt_list(") else {
        return (String::new(), "ValueError: missing path\n".to_string());
    };
    let norm = if path == "/" { path.clone() } else { path.trim_end_matches('/').to_string() };
    let guard = fs.lock().expect("sim fs poisoned");
    let mut out = String::new();
    for (file_path, bytes) in &guard.files {
        if parent_of(file_path) == norm {
            let name = file_path.rsplit('/').next().unwrap_or(file_path);
            out.push_str(&format!("{name}\t{file_path}\t0\t{}\n", bytes.len()));
        }
    }
    for dir_path in &guard.dirs {
        if parent_of(dir_path) == norm {
            let name = dir_path.rsplit('/').next().unwrap_or(dir_path);
            out.push_str(&format!("{name}\t{dir_path}\t1\t0\n"));
        }
    }
    (out, String::new())
}

fn sim_stat(source: &str, fs: &Arc<Mutex<VirtualFs>>) -> (String, String) {
    let Some(path) = find_quoted_after(source, "os.stat(") else {
        return (String::new(), "ValueError: missing path\n".to_string());
    };
    let guard = fs.lock().expect("sim fs poisoned");
    match guard.files.get(&path) {
        Some(bytes) => (format!("{}\n", bytes.len()), String::new()),
        None => ("ENOENT\n".to_string(), String::new()),
    }
}

fn sim_md5(source: &str, fs: &Arc<Mutex<VirtualFs>>) -> (String, String) {
    use md5::{Digest, Md5};
    let Some(path) = find_quoted_after(source, "open(") else {
        return (String::new(), "ValueError: missing path\n".to_string());
    };
    let guard = fs.lock().expect("sim fs poisoned");
    match guard.files.get(&path) {
        Some(bytes) => {
            let mut hasher = Md5::new();
            hasher.update(bytes);
            (format!("{:x}\n", hasher.finalize()), String::new())
        }
        None => (String::new(), "OSError: [Errno 2] ENOENT\n".to_string()),
    }
}

fn sim_read_chunk(source: &str, fs: &Arc<Mutex<VirtualFs>>) -> (String, String) {
    let Some(path) = find_quoted_after(source, "open(") else {
        return (String::new(), "ValueError: missing path\n".to_string());
    };
    let offset = find_number_after(source, "f.seek(").unwrap_or(0) as usize;
    let len = find_number_after(source, "f.read(").unwrap_or(0) as usize;
    let guard = fs.lock().expect("sim fs poisoned");
    match guard.files.get(&path) {
        Some(bytes) => {
            let end = (offset + len).min(bytes.len());
            let slice = if offset < bytes.len() { &bytes[offset..end] } else { &[] };
            (
                format!("{}\n", base64::engine::general_purpose::STANDARD.encode(slice)),
                String::new(),
            )
        }
        None => (String::new(), "OSError: [Errno 2] ENOENT\n".to_string()),
    }
}

fn sim_remove(source: &str, fs: &Arc<Mutex<VirtualFs>>) -> (String, String) {
    let Some(path) = find_quoted_after(source, "os.remove(") else {
        return (String::new(), "ValueError: missing path\n".to_string());
    };
    let mut guard = fs.lock().expect("sim fs poisoned");
    if guard.files.remove(&path).is_some() {
        let ok = if source.contains("print('OK')") { "OK\n" } else { "" };
        (ok.to_string(), String::new())
    } else {
        (String::new(), "OSError: [Errno 2] ENOENT\n".to_string())
    }
}

fn sim_mkdir(source: &str, fs: &Arc<Mutex<VirtualFs>>) -> (String, String) {
    let Some(path) = find_quoted_after(source, "os.mkdir(") else {
        return (String::new(), "ValueError: missing path\n".to_string());
    };
    let mut guard = fs.lock().expect("sim fs poisoned");
    guard.dirs.insert(path);
    let ok = if source.contains("print('OK')") { "OK\n" } else { "" };
    (ok.to_string(), String::new())
}

fn sim_rmdir(source: &str, fs: &Arc<Mutex<VirtualFs>>) -> (String, String) {
    let Some(path) = find_quoted_after(source, "os.rmdir(") else {
        return (String::new(), "ValueError: missing path\n".to_string());
    };
    let mut guard = fs.lock().expect("sim fs poisoned");
    guard.dirs.remove(&path);
    let ok = if source.contains("print('OK')") { "OK\n" } else { "" };
    (ok.to_string(), String::new())
}

fn extract_quoted(s: &str) -> Option<String> {
    let start = s.find(['\'', '"'])?;
    let quote = s.as_bytes()[start];
    let rest = &s[start + 1..];
    let end = rest.find(quote as char)?;
    Some(rest[..end].to_string())
}

fn eval_print(expr: &str, fs: &Arc<Mutex<VirtualFs>>) -> String {
    let expr = expr.trim();
    if let Some(text) = extract_quoted(expr) {
        return text;
    }
    if let Ok(n) = expr.parse::<i64>() {
        return n.to_string();
    }
    if let Some((lhs, rhs)) = expr.split_once('+') {
        let lhs = lhs.trim().parse::<i64>();
        let rhs = rhs.trim().parse::<i64>();
        if let (Ok(l), Ok(r)) = (lhs, rhs) {
            return (l + r).to_string();
        }
    }
    if expr.starts_with("b2a_base64") || expr.contains("b2a_base64") {
        if let Some(path) = extract_quoted(expr) {
            let guard = fs.lock().expect("sim fs poisoned");
            if let Some(bytes) = guard.files.get(&path) {
                return base64::engine::general_purpose::STANDARD.encode(bytes);
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::EventBus;

    #[tokio::test]
    async fn simulated_device_answers_print() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let (session, _device) = spawn_simulated_device(bus, "SIM".into());
        let result = session
            .execute("print('hi')", std::time::Duration::from_secs(1))
            .await;
        assert!(result.success);
        assert_eq!(result.output.trim(), "hi");
    }
}
