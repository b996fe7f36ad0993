use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use libuplink::resolver::DependencyResolver;
use libuplink::{
    DownloadConfig, LogSink, ResolverConfig, SessionManager, SessionManagerConfig, current_target,
    default_specs,
};
use uplink_protocol::{DependencySpec, Event, paths};

use crate::config::ServerConfig;
use crate::connection;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Shared daemon state handed to each client connection.
pub struct SharedState {
    pub manager: Arc<SessionManager>,
    pub resolver: Arc<DependencyResolver>,
    pub specs: Vec<DependencySpec>,
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Clean up stale socket
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write PID file
    let pid_path = paths::pid_file_path();
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let platform = current_target()?;
    let specs = match &config.dependencies {
        Some(specs) => specs.clone(),
        None => default_specs(platform),
    };

    let (events, _) = broadcast::channel::<Event>(EVENT_BUS_CAPACITY);
    let resolver = Arc::new(DependencyResolver::new(
        ResolverConfig {
            bundle_dir: config.bundle_dir.clone(),
            managed_dir: config.bin_dir.clone(),
            platform: platform.to_string(),
            download: DownloadConfig {
                max_attempts: config.download_max_attempts,
                attempt_timeout: Duration::from_secs(config.download_attempt_timeout_secs),
                ..DownloadConfig::default()
            },
        },
        events.clone(),
    )?);
    let sink = Arc::new(LogSink::open(&config.log_dir)?);
    let manager = Arc::new(SessionManager::new(
        SessionManagerConfig {
            required: specs.clone(),
            idle_threshold: Duration::from_millis(config.idle_threshold_ms),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        },
        Arc::clone(&resolver),
        sink,
        events,
    ));

    let listener = UnixListener::bind(&config.socket_path)?;
    info!(
        socket = %config.socket_path.display(),
        pid = std::process::id(),
        platform,
        "uplink server started"
    );

    let state = Arc::new(SharedState {
        manager,
        resolver,
        specs,
    });

    // Handle shutdown signals
    let socket_path = config.socket_path.clone();
    let pid_path_clone = pid_path.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
        let _ = std::fs::remove_file(&socket_path);
        let _ = std::fs::remove_file(&pid_path_clone);
        std::process::exit(0);
    });

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    connection::handle_client(stream, state).await;
                });
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }
}
