//! Package install/uninstall: a static quick catalogue of known pure-Python
//! packages, falling back to the device's own `mip`/`upip` installers for
//! anything the catalogue doesn't know about.

pub mod catalog;

use std::sync::Arc;
use std::time::Duration;

use device_session::Session;
use event_bus::{EventBus, EventKind};
use repl_proto::PackageDescriptor;
use serde_json::json;

const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PkgError {
    #[error("device reported an error: {0}")]
    Device(String),
    #[error("failed to fetch {url}: {source}")]
    Fetch { url: String, source: reqwest::Error },
    #[error("no installer succeeded for {0}")]
    NoInstallerSucceeded(String),
}

fn emit_progress(bus: &Arc<EventBus>, package: &str, status: &str, progress: f64, message: &str, error: Option<&str>) {
    bus.emit(
        EventKind::PackageProgress,
        json!({
            "status": status,
            "package": package,
            "progress": progress,
            "message": message,
            "error": error,
        }),
        None,
    );
}

/// Install `name` on the device. Tries the quick catalogue first, then the
/// on-device `mip` module, then the legacy `upip` module. `force` bypasses
/// the already-installed shortcut for catalogue entries.
pub async fn install(
    session: &Arc<Session>,
    bus: &Arc<EventBus>,
    name: &str,
    force: bool,
) -> Result<(), PkgError> {
    emit_progress(bus, name, "starting", 0.0, &format!("installing {name}"), None);

    if catalog::find(name).is_some() {
        let result = install_from_catalogue(session, bus, name, force).await;
        match &result {
            Ok(()) => emit_progress(bus, name, "done", 1.0, &format!("{name} installed"), None),
            Err(e) => emit_progress(bus, name, "error", 1.0, "install failed", Some(&e.to_string())),
        }
        return result;
    }

    emit_progress(bus, name, "progress", 0.3, "trying mip", None);
    if try_installer(session, "mip", name).await? {
        emit_progress(bus, name, "done", 1.0, &format!("{name} installed via mip"), None);
        return Ok(());
    }

    emit_progress(bus, name, "progress", 0.6, "trying upip", None);
    if try_installer(session, "upip", name).await? {
        emit_progress(bus, name, "done", 1.0, &format!("{name} installed via upip"), None);
        return Ok(());
    }

    let err = PkgError::NoInstallerSucceeded(name.to_string());
    emit_progress(bus, name, "error", 1.0, "no installer succeeded", Some(&err.to_string()));
    Err(err)
}

fn install_from_catalogue<'a>(
    session: &'a Arc<Session>,
    bus: &'a Arc<EventBus>,
    name: &'a str,
    force: bool,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), PkgError>> + Send + 'a>> {
    Box::pin(async move {
        let descriptor: PackageDescriptor = catalog::find(name).expect("caller already checked presence");

        for dependency in &descriptor.dependencies {
            install_from_catalogue(session, bus, dependency, force).await?;
        }

        if !force {
            if let Some(first) = descriptor.files.first() {
                if file_transfer::exists(session, &first.remote_path)
                    .await
                    .unwrap_or(false)
                {
                    emit_progress(bus, name, "progress", 1.0, &format!("{name} already installed"), None);
                    return Ok(());
                }
            }
        }

        file_transfer::mkdir(session, "/lib")
            .await
            .map_err(|e| PkgError::Device(e.to_string()))?;

        let total = descriptor.files.len().max(1) as f64;
        for (i, pkg_file) in descriptor.files.iter().enumerate() {
            let bytes = match &pkg_file.fetch_url {
                Some(url) => {
                    let response = reqwest::get(url)
                        .await
                        .map_err(|source| PkgError::Fetch { url: url.clone(), source })?;
                    response
                        .bytes()
                        .await
                        .map_err(|source| PkgError::Fetch { url: url.clone(), source })?
                        .to_vec()
                }
                None => Vec::new(),
            };
            file_transfer::write(session, bus, &pkg_file.remote_path, &bytes, true)
                .await
                .map_err(|e| PkgError::Device(e.to_string()))?;
            emit_progress(
                bus,
                name,
                "progress",
                (i + 1) as f64 / total,
                &format!("wrote {}", pkg_file.remote_path),
                None,
            );
        }
        Ok(())
    })
}

async fn try_installer(session: &Arc<Session>, module: &str, name: &str) -> Result<bool, PkgError> {
    let source = format!(
        "import {module}\n\
         try:\n\
         \t{module}.install({name})\n\
         \tprint('SUCCESS')\n\
         except Exception as e:\n\
         \tprint('FAILURE: ' + str(e))\n",
        module = module,
        name = file_transfer_py_quote(name),
    );
    let result = session.execute(&source, EXECUTE_TIMEOUT).await;
    if !result.success {
        return Ok(false);
    }
    Ok(result.output.contains("SUCCESS"))
}

fn file_transfer_py_quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Remove `name`, trying `/lib/<name>.py`, `/lib/<name>/`, then `/<name>.py`
/// in that order. Success at any location ends the operation.
pub async fn uninstall(session: &Arc<Session>, bus: &Arc<EventBus>, name: &str) -> Result<(), PkgError> {
    emit_progress(bus, name, "starting", 0.0, &format!("uninstalling {name}"), None);

    let lib_file = format!("/lib/{name}.py");
    if file_transfer::exists(session, &lib_file).await.unwrap_or(false) {
        file_transfer::delete(session, bus, &lib_file)
            .await
            .map_err(|e| PkgError::Device(e.to_string()))?;
        emit_progress(bus, name, "done", 1.0, &format!("removed {lib_file}"), None);
        return Ok(());
    }

    let lib_dir = format!("/lib/{name}");
    if file_transfer::exists(session, &lib_dir).await.unwrap_or(false) {
        file_transfer::rmdir(session, &lib_dir, true)
            .await
            .map_err(|e| PkgError::Device(e.to_string()))?;
        emit_progress(bus, name, "done", 1.0, &format!("removed {lib_dir}"), None);
        return Ok(());
    }

    let root_file = format!("/{name}.py");
    if file_transfer::exists(session, &root_file).await.unwrap_or(false) {
        file_transfer::delete(session, bus, &root_file)
            .await
            .map_err(|e| PkgError::Device(e.to_string()))?;
        emit_progress(bus, name, "done", 1.0, &format!("removed {root_file}"), None);
        return Ok(());
    }

    emit_progress(bus, name, "done", 1.0, &format!("{name} was not installed"), None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_session::sim::spawn_simulated_device;

    fn new_bus() -> Arc<EventBus> {
        let bus = Arc::new(EventBus::new());
        bus.start();
        bus
    }

    #[tokio::test]
    async fn uninstall_of_absent_package_is_a_no_op_success() {
        let bus = new_bus();
        let (session, _device) = spawn_simulated_device(Arc::clone(&bus), "SIM".into());
        uninstall(&session, &bus, "nonexistent").await.unwrap();
    }

    #[tokio::test]
    async fn uninstall_removes_a_file_that_was_written() {
        let bus = new_bus();
        let (session, _device) = spawn_simulated_device(Arc::clone(&bus), "SIM".into());
        file_transfer::write(&session, &bus, "/lib/thing.py", b"x = 1\n", true)
            .await
            .unwrap();
        uninstall(&session, &bus, "thing").await.unwrap();
        assert!(!file_transfer::exists(&session, "/lib/thing.py").await.unwrap());
    }
}
