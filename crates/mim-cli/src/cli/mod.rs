//! CLI for the MIM media ingest manager.

mod commands;

#[cfg(test)]
mod tests;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mim_core::config;
use mim_core::paths::StateLayout;

use commands::{run_add, run_pipeline, run_quarantine, run_status};

/// Top-level CLI for the MIM media ingest manager.
#[derive(Debug, Parser)]
#[command(name = "mim")]
#[command(about = "MIM: resilient media ingest pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the ingest pipeline until interrupted.
    Run {
        /// Exit once every queue (including deferred conversions) drains.
        #[arg(long)]
        drain: bool,
    },

    /// Enqueue a link (CDN file or WebDAV collection) for ingestion.
    Add {
        /// HTTP/HTTPS URL to ingest.
        url: String,
        /// Bearer token for protected CDN/WebDAV endpoints.
        #[arg(long, value_name = "TOKEN")]
        auth_token: Option<String>,
    },

    /// Show queue depths and in-flight tasks from the latest snapshot.
    Status,

    /// List permanently failed tasks preserved for triage.
    Quarantine,
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let layout = StateLayout::default_root()?;

        match cli.command {
            CliCommand::Run { drain } => run_pipeline(cfg, layout, drain).await?,
            CliCommand::Add { url, auth_token } => run_add(&layout, &url, auth_token)?,
            CliCommand::Status => run_status(&layout)?,
            CliCommand::Quarantine => run_quarantine(&layout)?,
        }
        Ok(())
    }
}
