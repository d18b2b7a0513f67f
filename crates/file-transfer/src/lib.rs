//! Chunked file transfer and directory operations over the raw-REPL codec.
//!
//! Every operation here is a small MicroPython program executed through
//! [`device_session::Session::execute`]; the host never evaluates text the
//! device returns, it parses a fixed, deterministic line grammar (see
//! [`parse`]) instead of `eval`-ing a `repr()` (§9 of the design notes).

pub mod parse;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use device_session::Session;
use event_bus::{EventBus, EventKind};
use repl_proto::FileEntry;
use serde_json::json;

/// Bytes of file content moved per raw-REPL exchange. Keeps one chunk's
/// round trip comfortably under the default command timeout.
pub const CHUNK_SIZE: usize = 512;

const EXECUTE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum FileTransferError {
    #[error("device reported an error: {0}")]
    Device(String),
    #[error("failed to parse device response: {0}")]
    Parse(String),
    #[error("path not found: {0}")]
    NotFound(String),
}

fn py_quote(path: &str) -> String {
    format!("'{}'", path.replace('\\', "\\\\").replace('\'', "\\'"))
}

async fn run(session: &Arc<Session>, source: String) -> Result<String, FileTransferError> {
    let result = session.execute(&source, EXECUTE_TIMEOUT).await;
    if !result.success {
        return Err(FileTransferError::Device(result.error));
    }
    Ok(result.output)
}

/// List the direct children of `path`. Produced by a walk that prints one
/// tab-separated tuple per entry; a malformed line fails the whole call
/// rather than silently skipping it.
pub async fn list(session: &Arc<Session>, path: &str) -> Result<Vec<FileEntry>, FileTransferError> {
    let source = format!(
        "import os\n\
         def _rt_list(p):\n\
         \tfor name in os.listdir(p):\n\
         \t\tfull = p.rstrip('/') + '/' + name if p != '/' else '/' + name\n\
         \t\tst = os.stat(full)\n\
         \t\tis_dir = (st[0] & 0x4000) != 0\n\
         \t\tprint(name + '\\t' + full + '\\t' + ('1' if is_dir else '0') + '\\t' + str(st[6]))\n\
         _rt_list({path})\n",
        path = py_quote(path),
    );
    let output = run(session, source).await?;
    output
        .lines()
        .filter(|l| !l.is_empty())
        .map(parse::parse_entry_line)
        .collect::<Result<Vec<_>, _>>()
        .map_err(FileTransferError::Parse)
}

/// `os.stat(path).st_size`, or [`FileTransferError::NotFound`] if the path
/// does not exist.
pub async fn size(session: &Arc<Session>, path: &str) -> Result<u64, FileTransferError> {
    let source = format!(
        "import os\n\
         try:\n\
         \tprint(os.stat({path})[6])\n\
         except OSError:\n\
         \tprint('ENOENT')\n",
        path = py_quote(path),
    );
    let output = run(session, source).await?;
    let trimmed = output.trim();
    if trimmed == "ENOENT" {
        return Err(FileTransferError::NotFound(path.to_string()));
    }
    trimmed
        .parse::<u64>()
        .map_err(|e| FileTransferError::Parse(e.to_string()))
}

/// Whether `path` exists on the device.
pub async fn exists(session: &Arc<Session>, path: &str) -> Result<bool, FileTransferError> {
    match size(session, path).await {
        Ok(_) => Ok(true),
        Err(FileTransferError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the whole file at `path` in [`CHUNK_SIZE`]-byte chunks, emitting a
/// `FILE_PROGRESS` event after each chunk with a monotonically
/// non-decreasing `progress` in `[0, 1]`.
pub async fn read(
    session: &Arc<Session>,
    bus: &Arc<EventBus>,
    path: &str,
) -> Result<Vec<u8>, FileTransferError> {
    let total = size(session, path).await?;
    let mut out = Vec::with_capacity(total as usize);
    let mut offset: u64 = 0;
    if total == 0 {
        bus.emit(
            EventKind::FileProgress,
            json!({ "path": path, "progress": 1.0 }),
            None,
        );
        return Ok(out);
    }
    while offset < total {
        let remaining = (total - offset).min(CHUNK_SIZE as u64);
        let source = format!(
            "f = open({path}, 'rb')\n\
             f.seek({offset})\n\
             import ubinascii\n\
             print(ubinascii.b2a_base64(f.read({len})).decode().strip())\n\
             f.close()\n",
            path = py_quote(path),
            offset = offset,
            len = remaining,
        );
        let output = run(session, source).await?;
        let chunk = base64::engine::general_purpose::STANDARD
            .decode(output.trim())
            .map_err(|e| FileTransferError::Parse(e.to_string()))?;
        out.extend_from_slice(&chunk);
        offset += remaining;
        bus.emit(
            EventKind::FileProgress,
            json!({ "path": path, "progress": offset as f64 / total as f64 }),
            None,
        );
    }
    bus.emit(
        EventKind::FileDownloaded,
        json!({ "path": path, "size": total }),
        None,
    );
    Ok(out)
}

/// Write `data` to `path`, creating parent directories first when `mkdir`
/// is set. On any chunk failure a best-effort close is attempted before the
/// error propagates.
pub async fn write(
    session: &Arc<Session>,
    bus: &Arc<EventBus>,
    path: &str,
    data: &[u8],
    mkdir: bool,
) -> Result<(), FileTransferError> {
    if mkdir {
        if let Some(parent) = parent_dir(path) {
            self::mkdir(session, &parent).await?;
        }
    }

    let open_source = format!("f = open({path}, 'wb')\n", path = py_quote(path));
    run(session, open_source).await?;

    let total = data.len();
    for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(chunk);
        let write_source = format!(
            "import ubinascii\n\
             f.write(ubinascii.a2b_base64({encoded}))\n",
            encoded = py_quote(&encoded),
        );
        if let Err(e) = run(session, write_source).await {
            let _ = run(session, "f.close()\n".to_string()).await;
            return Err(e);
        }
        let written = ((i + 1) * CHUNK_SIZE).min(total.max(1));
        let progress = if total == 0 { 1.0 } else { written as f64 / total as f64 };
        bus.emit(
            EventKind::FileProgress,
            json!({ "path": path, "progress": progress }),
            None,
        );
    }
    if data.is_empty() {
        bus.emit(
            EventKind::FileProgress,
            json!({ "path": path, "progress": 1.0 }),
            None,
        );
    }

    run(session, "f.close()\n".to_string()).await?;
    bus.emit(
        EventKind::FileUploaded,
        json!({ "path": path, "size": total }),
        None,
    );
    Ok(())
}

/// `os.remove(path)`.
pub async fn delete(
    session: &Arc<Session>,
    bus: &Arc<EventBus>,
    path: &str,
) -> Result<(), FileTransferError> {
    let source = format!(
        "import os\nos.remove({path})\nprint('OK')\n",
        path = py_quote(path),
    );
    let output = run(session, source).await?;
    if output.trim() != "OK" {
        return Err(FileTransferError::Parse(format!(
            "unexpected delete response: {output:?}"
        )));
    }
    bus.emit(EventKind::FileDeleted, json!({ "path": path }), None);
    Ok(())
}

/// `rmdir`, optionally walking and deleting children depth-first first.
pub async fn rmdir(
    session: &Arc<Session>,
    path: &str,
    recursive: bool,
) -> Result<(), FileTransferError> {
    if recursive {
        let children = list(session, path).await.unwrap_or_default();
        for child in children {
            if child.is_dir {
                Box::pin(rmdir(session, &child.path, true)).await?;
            } else {
                let source = format!("import os\nos.remove({path})\n", path = py_quote(&child.path));
                run(session, source).await?;
            }
        }
    }
    let source = format!(
        "import os\nos.rmdir({path})\nprint('OK')\n",
        path = py_quote(path),
    );
    let output = run(session, source).await?;
    if output.trim() != "OK" {
        return Err(FileTransferError::Parse(format!(
            "unexpected rmdir response: {output:?}"
        )));
    }
    Ok(())
}

/// Create every missing component of `path`, tolerating `EEXIST` (errno 17)
/// as success so two successive calls yield the same outcome.
pub async fn mkdir(session: &Arc<Session>, path: &str) -> Result<(), FileTransferError> {
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        let source = format!(
            "import os\n\
             try:\n\
             \tos.mkdir({path})\n\
             except OSError as e:\n\
             \tif e.args[0] != 17:\n\
             \t\traise\n\
             print('OK')\n",
            path = py_quote(&current),
        );
        let output = run(session, source).await?;
        if output.trim() != "OK" {
            return Err(FileTransferError::Parse(format!(
                "unexpected mkdir response: {output:?}"
            )));
        }
    }
    Ok(())
}

fn parent_dir(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        Some("/".to_string())
    } else {
        Some(trimmed[..idx].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_session::sim::spawn_simulated_device;
    use event_bus::EventBus;

    fn new_bus() -> Arc<EventBus> {
        let bus = Arc::new(EventBus::new());
        bus.start();
        bus
    }

    #[tokio::test]
    async fn write_then_read_round_trips_binary_content() {
        let bus = new_bus();
        let (session, _device) = spawn_simulated_device(Arc::clone(&bus), "SIM".into());
        let data: Vec<u8> = (0..2049u32).map(|i| (i % 256) as u8).collect();
        write(&session, &bus, "/data.bin", &data, true).await.unwrap();
        let read_back = read(&session, &bus, "/data.bin").await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn write_then_read_round_trips_empty_file() {
        let bus = new_bus();
        let (session, _device) = spawn_simulated_device(Arc::clone(&bus), "SIM".into());
        write(&session, &bus, "/empty.bin", &[], true).await.unwrap();
        let read_back = read(&session, &bus, "/empty.bin").await.unwrap();
        assert!(read_back.is_empty());
    }

    #[tokio::test]
    async fn mkdir_is_idempotent() {
        let bus = new_bus();
        let (session, _device) = spawn_simulated_device(bus, "SIM".into());
        mkdir(&session, "/lib/pkg").await.unwrap();
        mkdir(&session, "/lib/pkg").await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let bus = new_bus();
        let (session, _device) = spawn_simulated_device(Arc::clone(&bus), "SIM".into());
        write(&session, &bus, "/a.txt", b"hi", true).await.unwrap();
        delete(&session, &bus, "/a.txt").await.unwrap();
        assert!(matches!(
            exists(&session, "/a.txt").await,
            Ok(false) | Err(FileTransferError::NotFound(_))
        ));
    }
}
