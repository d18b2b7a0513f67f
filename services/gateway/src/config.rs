//! On-disk `AppConfig` persistence: a user-scoped JSON file, rewritten
//! atomically (write-to-temp + rename) so a crash mid-write never leaves a
//! truncated config behind.

use std::path::{Path, PathBuf};

use repl_proto::AppConfig;

/// Default location: `<config dir>/micropython-gateway/config.json`. Falls
/// back to the current directory if the platform config dir is unknown.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("micropython-gateway")
        .join("config.json")
}

/// Load `AppConfig` from `path`. A missing file yields defaults silently; a
/// malformed file yields defaults after logging the parse error.
pub fn load(path: &Path) -> AppConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed config file");
            AppConfig::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read config file");
            AppConfig::default()
        }
    }
}

/// Persist `config` to `path` atomically.
pub fn save(path: &Path, config: &AppConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(config).expect("AppConfig always serializes");
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.json"));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"not json").unwrap();
        assert_eq!(load(&path), AppConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.default_baudrate = 9600;
        save(&path, &config).unwrap();
        assert_eq!(load(&path), config);
    }
}
