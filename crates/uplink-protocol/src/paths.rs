use std::path::PathBuf;

/// Returns the default socket path for the uplink daemon.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("uplink.sock")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/uplink-{uid}.sock"))
    }
}

/// Returns the config directory path for uplink.
pub fn config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("uplink")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("uplink")
    } else {
        PathBuf::from("/tmp/uplink")
    }
}

/// Returns the data directory path (managed binaries, durable logs).
pub fn data_dir() -> PathBuf {
    if let Ok(data_dir) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_dir).join("uplink")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("uplink")
    } else {
        PathBuf::from("/tmp/uplink")
    }
}

/// Managed dependency installation directory, exclusively owned by the
/// dependency resolver.
pub fn bin_dir() -> PathBuf {
    data_dir().join("bin")
}

/// Durable log directory.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Returns the default PID file path for the uplink daemon.
pub fn pid_file_path() -> PathBuf {
    config_dir().join("uplink.pid")
}

/// Returns the config file path for the uplink daemon.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}
