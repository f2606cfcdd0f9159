//! CLI interface for topx-ingest: argument parsing and orchestration of one run.
//!
//! All ingest logic (hierarchy walk, batching, packaging, routing) lives in
//! `topx-ingest-core`. This module wires the Preservica adapters into it.
//!
//! ## How To Use
//! - Command line: `topx-ingest sync --config ingest.yaml`.
//! - Programmatic/integration use: call [`run`] with a constructed [`Cli`].

use crate::catalog::PreservicaCatalog;
use crate::load_config::load_config;
use crate::logging::DEFAULT_LOG_FILE;
use crate::session::{Credentials, PreservicaSession};
use crate::transport::PreservicaTransport;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use topx_ingest_core::retry::Retrying;
use topx_ingest_core::synchronise::synchronise;

/// CLI for topx-ingest: mirror ToPX archival hierarchies into Preservica.
#[derive(Parser)]
#[clap(
    name = "topx-ingest",
    version,
    about = "Idempotently ingest ToPX archief/serie/dossier folders into Preservica"
)]
pub struct Cli {
    /// File the run log is appended to
    #[clap(long, global = true, default_value = DEFAULT_LOG_FILE)]
    pub log_file: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronise the data folder into the repository using the given config file
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// Async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config } => {
            let config = load_config(config)?;
            let credentials = Credentials::from_env()?;
            tracing::info!(command = "sync", "Starting synchronisation process");

            let session = Arc::new(PreservicaSession::new(config.preservica.clone(), credentials)?);
            let catalog = Retrying::new(PreservicaCatalog::new(session.clone()), config.retry.clone());
            let transport = PreservicaTransport::new(session);

            match synchronise(&config.ingest, &catalog, &transport).await {
                Ok(report) => {
                    tracing::info!(
                        command = "sync",
                        containers_created = report.containers_created(),
                        containers_reused = report.containers_reused(),
                        packages = report.packages.len(),
                        skipped_batches = report.skipped_batches,
                        "Synchronisation complete"
                    );
                    match serde_json::to_string(&report) {
                        Ok(json) => tracing::debug!(report = %json, "Synchronisation report"),
                        Err(e) => tracing::warn!(error = %e, "Could not serialise report"),
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "sync", error = %e, "Synchronisation failed");
                    Err(anyhow::Error::new(e))
                }
            }
        }
    }
}
