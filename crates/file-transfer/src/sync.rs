//! Hash-based folder synchronization: diff a local directory against a
//! remote device directory and upload whatever differs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use device_session::Session;
use event_bus::EventBus;
use md5::{Digest, Md5};
use repl_proto::{SyncFile, SyncSummary};

use crate::{list, FileTransferError};

/// Names and extensions never synced, matching common VCS metadata, editor
/// dotfiles, and compiled-artifact leftovers.
const IGNORE_NAMES: &[&str] = &["__pycache__", ".git", ".vscode", ".idea", ".DS_Store", "Thumbs.db", ".env"];
const IGNORE_EXTENSIONS: &[&str] = &["pyc", "pyo"];

fn is_ignored(name: &str) -> bool {
    if IGNORE_NAMES.contains(&name) {
        return true;
    }
    if let Some(ext) = name.rsplit('.').next() {
        if IGNORE_EXTENSIONS.contains(&ext) {
            return true;
        }
    }
    false
}

fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    for chunk in bytes.chunks(8192) {
        hasher.update(chunk);
    }
    format!("{:x}", hasher.finalize())
}

fn walk_local(root: &Path, prefix: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else { continue };
        if is_ignored(name_str) {
            continue;
        }
        let path = entry.path();
        let rel = prefix.join(name_str);
        if entry.file_type()?.is_dir() {
            walk_local(&path, &rel, out)?;
        } else {
            out.push(rel);
        }
    }
    Ok(())
}

/// Request an on-device MD5 computed over 1 KiB reads, matching the
/// spec's integrity-check granularity.
async fn remote_md5(session: &Arc<Session>, path: &str) -> Result<String, FileTransferError> {
    let source = format!(
        "import uhashlib, ubinascii\n\
         h = uhashlib.md5()\n\
         f = open({path}, 'rb')\n\
         while True:\n\
         \tchunk = f.read(1024)\n\
         \tif not chunk:\n\
         \t\tbreak\n\
         \th.update(chunk)\n\
         f.close()\n\
         print(ubinascii.hexlify(h.digest()).decode())\n",
        path = crate::py_quote(path),
    );
    let output = crate::run(session, source).await?;
    Ok(output.trim().to_string())
}

/// Compare `local_root` against `remote_root`, returning one [`SyncFile`]
/// per surviving local file.
pub async fn compare(
    session: &Arc<Session>,
    local_root: &Path,
    remote_root: &str,
) -> Result<Vec<SyncFile>, FileTransferError> {
    let mut relative_paths = Vec::new();
    walk_local(local_root, Path::new(""), &mut relative_paths)
        .map_err(|e| FileTransferError::Parse(e.to_string()))?;

    let remote_root_trimmed = remote_root.trim_end_matches('/');
    let remote_entries = list(session, remote_root).await.unwrap_or_default();
    let remote_sizes: std::collections::HashMap<String, u64> = remote_entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| (e.path, e.size))
        .collect();

    let mut results = Vec::new();
    for rel in relative_paths {
        let local_path = local_root.join(&rel);
        let bytes = std::fs::read(&local_path).map_err(|e| FileTransferError::Parse(e.to_string()))?;
        let local_hash = md5_hex(&bytes);
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let remote_path = format!("{remote_root_trimmed}/{rel_str}");

        let (remote_hash, needs_upload) = match remote_sizes.get(&remote_path) {
            None => (None, true),
            Some(&remote_size) if remote_size != bytes.len() as u64 => {
                (Some("different_size".to_string()), true)
            }
            Some(_) => {
                let hash = remote_md5(session, &remote_path).await?;
                let differs = hash != local_hash;
                (Some(hash), differs)
            }
        };

        results.push(SyncFile {
            local_path: local_path.to_string_lossy().to_string(),
            remote_path,
            local_hash,
            remote_hash,
            needs_upload,
            size: bytes.len() as u64,
        });
    }
    Ok(results)
}

/// Upload every file [`compare`] marked `needs_upload`. `dry_run` computes
/// the same plan without writing anything.
pub async fn sync(
    session: &Arc<Session>,
    bus: &Arc<EventBus>,
    local_root: &Path,
    remote_root: &str,
    dry_run: bool,
) -> Result<SyncSummary, FileTransferError> {
    let diff = compare(session, local_root, remote_root).await?;
    let mut summary = SyncSummary::default();
    for file in diff {
        if !file.needs_upload {
            summary.skipped += 1;
            continue;
        }
        if dry_run {
            summary.uploaded += 1;
            continue;
        }
        let bytes = match std::fs::read(&file.local_path) {
            Ok(b) => b,
            Err(e) => {
                summary.failed += 1;
                summary.errors.push(format!("{}: {e}", file.local_path));
                continue;
            }
        };
        match crate::write(session, bus, &file.remote_path, &bytes, true).await {
            Ok(()) => summary.uploaded += 1,
            Err(e) => {
                summary.failed += 1;
                summary.errors.push(format!("{}: {e}", file.remote_path));
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_vcs_and_editor_metadata() {
        assert!(is_ignored("__pycache__"));
        assert!(is_ignored(".git"));
        assert!(is_ignored("module.pyc"));
        assert!(!is_ignored("main.py"));
    }

    #[test]
    fn md5_hex_is_stable_across_chunk_boundaries() {
        let small = md5_hex(b"hello world");
        let large = md5_hex(&vec![b'x'; 20_000]);
        assert_ne!(small, large);
        assert_eq!(md5_hex(b"hello world"), small);
    }

    #[tokio::test]
    async fn compare_and_sync_match_the_spec_scenario() {
        use device_session::sim::spawn_simulated_device;
        use std::sync::Arc;

        let bus = Arc::new(EventBus::new());
        bus.start();
        let (session, _device) = spawn_simulated_device(Arc::clone(&bus), "SIM".into());

        crate::write(&session, &bus, "/app/a.py", b"A", true).await.unwrap();
        crate::write(&session, &bus, "/app/b.py", b"X", true).await.unwrap();

        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("a.py"), b"A").unwrap();
        std::fs::write(local.path().join("b.py"), b"B").unwrap();

        let diff = compare(&session, local.path(), "/app").await.unwrap();
        let a = diff.iter().find(|f| f.remote_path == "/app/a.py").unwrap();
        let b = diff.iter().find(|f| f.remote_path == "/app/b.py").unwrap();
        assert!(!a.needs_upload);
        assert!(b.needs_upload);

        let summary = sync(&session, &bus, local.path(), "/app", false).await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);

        let uploaded = crate::read(&session, &bus, "/app/b.py").await.unwrap();
        assert_eq!(uploaded, b"B");
    }
}
