//! Serve command: runs the HTTP API and the audit writers until Ctrl-C.

use anyhow::{Context, Result};
use clap::Args;
use roster_service::Roster;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::ConfigArgs;

/// Arguments for the serve command.
#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Executes the serve command.
pub async fn execute(args: ServeArgs) -> Result<()> {
    let config = args.config.resolve()?;
    let bind = config.http.bind;
    info!(
        bind = %bind,
        writers = config.writer.workers,
        batch_size = config.writer.batch_size,
        dead_letter_file = ?config.emitter.dead_letter_file,
        "starting roster"
    );

    let roster = Roster::builder(config)
        .build()
        .context("failed to initialize roster")?;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    roster
        .serve(listener, shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
    }
}
