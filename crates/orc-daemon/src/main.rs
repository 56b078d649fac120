//! orc daemon -- opens the project and global databases, wires the engine,
//! and serves the WebSocket event stream for one project.

use anyhow::{Context, Result};
use orc_core::config::OrcConfig;
use tracing::info;

mod daemon;
mod logging;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config (defaults when the file is absent), then logging.
    let config = OrcConfig::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        OrcConfig::default()
    });
    logging::init_logging("orc-daemon", &config.general.log_level);

    let project_root = std::env::current_dir().context("cannot determine project root")?;
    info!(
        project = %project_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "orc daemon starting"
    );

    let bind_addr = format!("{}:{}", config.daemon.host, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "listener bound");

    let daemon = daemon::Daemon::new(config, project_root)
        .await
        .context("failed to initialise daemon")?;

    daemon.run_with_listener(listener).await?;

    info!("orc daemon stopped");
    Ok(())
}
