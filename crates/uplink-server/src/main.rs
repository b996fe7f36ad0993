mod config;
mod connection;
mod server;

use std::path::PathBuf;

use anyhow::{Result, bail};
use tracing_subscriber::EnvFilter;

struct Args {
    socket: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args {
            socket: None,
            config: None,
        };
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--socket" => {
                    let Some(value) = iter.next() else {
                        bail!("--socket requires a path");
                    };
                    args.socket = Some(PathBuf::from(value));
                }
                "--config" => {
                    let Some(value) = iter.next() else {
                        bail!("--config requires a path");
                    };
                    args.config = Some(PathBuf::from(value));
                }
                other => bail!("unknown argument: {other}"),
            }
        }
        Ok(args)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "uplink=info".into()),
        )
        .init();

    let args = Args::parse()?;
    let mut config = config::ServerConfig::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    server::run(config).await
}
