//! The MicroPython raw-REPL framing protocol.
//!
//! Raw REPL wraps a submitted Python source blob in `OK<stdout>\x04<stderr>\x04>`.
//! Every function here assumes the caller already holds the session's codec
//! lock and has paused the background reader — it reads directly off the
//! shared transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::Mutex as AsyncMutex;

use repl_proto::ReplResult;

use crate::{BoxedReader, Session};

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const ENTER_RAW: u8 = 0x01;
const EXIT_RAW: u8 = 0x02;

/// Hard ceiling on the accumulated payload of one `execute` call. Guards
/// against a malformed device that never emits the terminating `\x04>`.
const MAX_ACCUMULATED_PAYLOAD: usize = 16 * 1024 * 1024;

/// Read from `reader` until `needle` has been seen in the accumulated
/// buffer, or `deadline` elapses. Returns everything read so far either way
/// so callers can inspect a partial match.
async fn read_until(
    reader: &Arc<AsyncMutex<BoxedReader>>,
    needle: &[u8],
    deadline: Duration,
) -> (Vec<u8>, bool) {
    read_until_seeded(reader, Vec::new(), needle, deadline).await
}

/// Like [`read_until`] but starts from bytes already pulled off the reader
/// by a previous call (e.g. whatever trailed an `OK` marker in the same
/// read), checking them for `needle` before issuing any further reads.
async fn read_until_seeded(
    reader: &Arc<AsyncMutex<BoxedReader>>,
    mut buf: Vec<u8>,
    needle: &[u8],
    deadline: Duration,
) -> (Vec<u8>, bool) {
    let start = Instant::now();
    let mut chunk = [0u8; 256];
    loop {
        if ends_with_or_contains(&buf, needle) {
            return (buf, true);
        }
        let remaining = deadline.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return (buf, false);
        }
        let mut guard = reader.lock().await;
        match tokio::time::timeout(remaining.min(Duration::from_millis(100)), guard.read(&mut chunk))
            .await
        {
            Ok(Ok(0)) => return (buf, false),
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_ACCUMULATED_PAYLOAD {
                    return (buf, false);
                }
            }
            Ok(Err(_)) => return (buf, false),
            Err(_elapsed) => {}
        }
    }
}

fn ends_with_or_contains(buf: &[u8], needle: &[u8]) -> bool {
    buf.windows(needle.len().max(1)).any(|w| w == needle)
}

/// `read_until` specialised for the set of markers `enter_raw_repl` accepts.
async fn read_until_any_of(
    reader: &Arc<AsyncMutex<BoxedReader>>,
    deadline: Duration,
    needles: &[&[u8]],
) -> (Vec<u8>, bool) {
    let start = Instant::now();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        if needles.iter().any(|n| ends_with_or_contains(&buf, n)) {
            return (buf, true);
        }
        let remaining = deadline.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return (buf, false);
        }
        let mut guard = reader.lock().await;
        match tokio::time::timeout(remaining.min(Duration::from_millis(100)), guard.read(&mut chunk))
            .await
        {
            Ok(Ok(0)) => return (buf, false),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => return (buf, false),
            Err(_elapsed) => {}
        }
    }
}

/// Used by [`Session::reset`] to wait for either the MicroPython banner or
/// the friendly-REPL prompt after a reset.
pub(crate) async fn read_until_any(
    reader: &Arc<AsyncMutex<BoxedReader>>,
    deadline: Duration,
    needles: &[&str],
) -> (String, bool) {
    let needle_bytes: Vec<&[u8]> = needles.iter().map(|s| s.as_bytes()).collect();
    let (buf, matched) = read_until_any_of(reader, deadline, &needle_bytes).await;
    (String::from_utf8_lossy(&buf).to_string(), matched)
}

async fn enter_raw_repl(session: &Session) -> bool {
    if session.in_raw_mode.load(std::sync::atomic::Ordering::SeqCst) {
        return true;
    }
    let _ = session.write_bytes(&[CTRL_C]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    if session.write_bytes(&[ENTER_RAW]).await.is_err() {
        return false;
    }
    let (_, matched) = read_until_any_of(
        &session.reader,
        Duration::from_secs(1),
        &[b"raw REPL", b">"],
    )
    .await;
    if matched {
        session
            .in_raw_mode
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
    matched
}

async fn exit_raw_repl(session: &Session) {
    let _ = session.write_bytes(&[EXIT_RAW]).await;
    session
        .in_raw_mode
        .store(false, std::sync::atomic::Ordering::SeqCst);
}

/// Drain whatever is immediately available without blocking for long;
/// called before submitting a program so stray echoes don't pollute output.
async fn drain_pending(reader: &Arc<AsyncMutex<BoxedReader>>) {
    let mut chunk = [0u8; 256];
    loop {
        let mut guard = reader.lock().await;
        match tokio::time::timeout(Duration::from_millis(20), guard.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => continue,
            _ => return,
        }
    }
}

/// Run `source` through the raw REPL and parse its `OK<out>\x04<err>\x04>`
/// response. The caller must already hold the codec lock and have paused
/// the background reader.
pub(crate) async fn execute(session: &Session, source: &str, timeout: Duration) -> ReplResult {
    if !enter_raw_repl(session).await {
        return ReplResult::failed("failed to enter raw REPL");
    }

    drain_pending(&session.reader).await;

    if let Err(e) = session.write_bytes(source.as_bytes()).await {
        return ReplResult::failed(format!("write failed: {e}"));
    }
    if let Err(e) = session.write_bytes(&[CTRL_D]).await {
        return ReplResult::failed(format!("write failed: {e}"));
    }

    let (ack, matched) = read_until(&session.reader, b"OK", Duration::from_secs(2)).await;
    if !matched {
        return ReplResult::failed("device did not acknowledge with OK");
    }
    // Whatever trailed the "OK" marker in the same read belongs to the
    // payload phase; recover it instead of discarding it.
    let ok_idx = ack
        .windows(2)
        .position(|w| w == b"OK")
        .map(|i| i + 2)
        .unwrap_or(ack.len());
    let carry = ack[ok_idx..].to_vec();

    // `carry` may already contain the whole `<out>\x04<err>\x04>` frame (the
    // simulated device, and often a real UART, delivers it in the same read
    // as the `OK` marker), so check it before pulling any more bytes.
    let (payload, matched) = read_until_seeded(&session.reader, carry, b"\x04>", timeout).await;
    if !matched {
        if payload.len() >= MAX_ACCUMULATED_PAYLOAD {
            return ReplResult::failed("raw REPL response exceeded maximum payload size");
        }
        return ReplResult::failed("timeout");
    }

    // Strip the two-byte `\x04>` terminator before splitting on the single
    // `\x04` that separates stdout from stderr.
    let payload = &payload[..payload.len().saturating_sub(2)];
    let mut parts = payload.splitn(2, |&b| b == CTRL_D);
    let output = parts.next().unwrap_or(&[]);
    let error = parts.next().unwrap_or(&[]);

    ReplResult {
        output: String::from_utf8_lossy(output).to_string(),
        error: String::from_utf8_lossy(error).to_string(),
        success: error.is_empty(),
    }
}

/// Fallback path used only when raw mode is unreachable: submit line by
/// line through the friendly REPL and classify failure by scanning the
/// captured text for `Traceback`/`Error`.
pub(crate) async fn execute_friendly(session: &Session, source: &str) -> ReplResult {
    exit_raw_repl(session).await;
    for line in source.lines() {
        if session.write_line(line).await.is_err() {
            return ReplResult::failed("write failed");
        }
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    let (buf, _) = read_until(&session.reader, b"\0", Duration::from_secs(2)).await;
    let text = String::from_utf8_lossy(&buf).to_string();
    if text.contains("Traceback") || text.contains("Error") {
        ReplResult::failed(text)
    } else {
        ReplResult::ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ends_with_or_contains_finds_substring() {
        assert!(ends_with_or_contains(b"abcOKdef", b"OK"));
        assert!(!ends_with_or_contains(b"abcdef", b"OK"));
    }
}
