//! Check-config command implementation.

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use super::ConfigArgs;

/// Arguments for the check-config command.
#[derive(Args)]
pub struct CheckConfigArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Runs the check-config command.
pub fn run(args: &CheckConfigArgs) -> Result<()> {
    let config = args.config.resolve()?;
    info!(source = ?args.config.config, "configuration is valid");

    let yaml = config.to_yaml().context("failed to render configuration")?;
    print!("{yaml}");
    Ok(())
}
