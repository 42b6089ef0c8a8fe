//! Starget mount server
//!
//! Loads the configuration, opens both axis controllers and publishes the
//! mount over Alpaca until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use starget_alpaca::{DiscoveryResponder, ALPACA_DISCOVERY_PORT};
use starget_mount::{Telescope, TelescopeConfig, CONTAINER_OVERRIDE_PATH};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long the in-flight motion may take to finish at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "starget", version, about = "Alpaca server for a German equatorial mount")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override file merged over the configuration, if it exists
    #[arg(long, default_value = CONTAINER_OVERRIDE_PATH)]
    override_config: PathBuf,

    /// Alpaca HTTP port, overrides `network.port`
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(level: &str, to_stdout: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if to_stdout {
        builder.init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TelescopeConfig::load_with_override(&args.config, Some(&args.override_config))
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.network.port = port;
    }
    init_logging(&config.logging.log_level, config.logging.log_to_stdout);
    info!("Starget {} starting", starget_mount::DRIVER_VERSION);

    let ip: IpAddr = config
        .network
        .ip_address
        .parse()
        .with_context(|| format!("Invalid network.ip_address '{}'", config.network.ip_address))?;
    let http_addr = SocketAddr::new(ip, config.network.port);
    let discovery = config.network.discovery;

    let telescope = Arc::new(
        Telescope::from_config(config)
            .context("Failed to open the axis controllers")?
            .with_config_path(&args.config),
    );

    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;
    let port = listener.local_addr()?.port();

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let discovery_task = if discovery {
        let addr = SocketAddr::new(ip, ALPACA_DISCOVERY_PORT);
        match DiscoveryResponder::bind(addr, port).await {
            Ok(responder) => Some(tokio::spawn(responder.run(stopped(stop_rx.clone())))),
            Err(e) => {
                warn!("Discovery disabled, cannot bind {}: {}", addr, e);
                None
            }
        }
    } else {
        None
    };

    let server = tokio::spawn(starget_alpaca::serve(
        listener,
        telescope.clone(),
        stopped(stop_rx),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    let _ = stop_tx.send(true);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server failed: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }
    if let Some(task) = discovery_task {
        if let Ok(Err(e)) = task.await {
            error!("Discovery responder failed: {}", e);
        }
    }

    if let Err(e) = telescope.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!("Motion worker did not stop cleanly: {}", e);
    }
    info!("Stopped");
    Ok(())
}
