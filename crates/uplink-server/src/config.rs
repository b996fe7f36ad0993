use serde::Deserialize;
use std::path::{Path, PathBuf};

use uplink_protocol::DependencySpec;
use uplink_protocol::paths;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Managed dependency installation directory.
    pub bin_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Binaries shipped alongside the application, tried before anything
    /// else.
    pub bundle_dir: Option<PathBuf>,
    pub idle_threshold_ms: u64,
    pub kill_grace_ms: u64,
    pub download_max_attempts: u32,
    pub download_attempt_timeout_secs: u64,
    /// Binaries every session requires. `None` falls back to the built-in
    /// set for the host platform.
    pub dependencies: Option<Vec<DependencySpec>>,
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        // Load from the config file when present, fall back to defaults.
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => paths::config_path(),
        };
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: paths::default_socket_path(),
            bin_dir: paths::bin_dir(),
            log_dir: paths::log_dir(),
            bundle_dir: None,
            idle_threshold_ms: 1500,
            kill_grace_ms: 3000,
            download_max_attempts: 3,
            download_attempt_timeout_secs: 300,
            dependencies: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config =
            ServerConfig::load(Some(&dir.path().join("absent.toml"))).expect("load defaults");
        assert_eq!(config.idle_threshold_ms, 1500);
        assert!(config.dependencies.is_none());
    }

    #[test]
    fn load_partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
socket_path = "/tmp/uplink-test.sock"
idle_threshold_ms = 250
dependencies = []
"#,
        )
        .expect("write config");

        let config = ServerConfig::load(Some(&path)).expect("load");
        assert_eq!(config.socket_path, PathBuf::from("/tmp/uplink-test.sock"));
        assert_eq!(config.idle_threshold_ms, 250);
        assert!(config.dependencies.is_some_and(|d| d.is_empty()));
        assert_eq!(config.download_max_attempts, 3);
    }
}
