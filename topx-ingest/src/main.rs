use anyhow::Result;
use clap::Parser;
use topx_ingest::cli::{run, Cli};
use topx_ingest::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.log_file)?;
    tracing::info!(log_file = %cli.log_file.display(), "CLI application startup: tracing initialised, environment loaded");

    let result = run(cli).await;
    match &result {
        Ok(_) => tracing::info!("CLI completed successfully"),
        Err(e) => tracing::error!(error = %e, "CLI exited with error"),
    }
    result
}
