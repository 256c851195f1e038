//! mirror-daemon: mirror a shared markup document into a local file.
//!
//! Edits to the file are diffed and submitted to the document service;
//! changes from other collaborators are written back to the file.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mirror_daemon::{Args, Daemon, MirrorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mirror_daemon=debug,mirror_core=debug"
    } else {
        "info,mirror_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = MirrorConfig::from_args(&args)?;

    info!("Starting mirror-daemon");
    info!("Service: {}", config.socket_url);
    info!("Mirror file: {}", config.mirror_path().display());

    let daemon = Daemon::new(config).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for the interrupt signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    daemon.run(shutdown).await?;
    info!("Shut down");
    Ok(())
}
