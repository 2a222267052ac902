//! CLI commands and argument parsing.

pub mod check_config;
pub mod serve;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use roster_service::RosterConfig;

/// Roster - student records with an asynchronous audit trail
#[derive(Parser)]
#[command(name = "roster")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service and audit writers
    Serve(serve::ServeArgs),

    /// Load, validate and print the effective configuration
    CheckConfig(check_config::CheckConfigArgs),

    /// Print version information
    Version,
}

/// Configuration source and overrides shared by every command.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(short, long, env = "ROSTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "ROSTER_BIND")]
    pub bind: Option<SocketAddr>,

    /// Number of audit writer workers
    #[arg(long, env = "ROSTER_WRITER_WORKERS")]
    pub workers: Option<usize>,

    /// Append abandoned audit events to this JSON-lines file
    #[arg(long, env = "ROSTER_DEAD_LETTER_FILE")]
    pub dead_letter_file: Option<PathBuf>,
}

impl ConfigArgs {
    /// Loads the file (or defaults), applies overrides and validates.
    pub fn resolve(&self) -> Result<RosterConfig> {
        let mut config = match &self.config {
            Some(path) => RosterConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => RosterConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.http.bind = bind;
        }
        if let Some(workers) = self.workers {
            config.writer.workers = workers;
        }
        if let Some(path) = &self.dead_letter_file {
            config.emitter.dead_letter_file = Some(path.clone());
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}
