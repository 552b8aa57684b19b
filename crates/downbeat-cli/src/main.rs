//! `downbeat` - the service binary.
//!
//! Two long-lived subcommands share one YAML config: `ingest` runs the
//! submission/metadata API, `scheduler` runs the task scheduler with its
//! SSE server. Startup validation failures (missing config, users file,
//! downloader binary, uncreatable directories) exit non-zero before any
//! service work begins.

mod bootstrap;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "downbeat", version, about = "Apple Music download orchestration services")]
struct Cli {
    /// Project root; shared files resolve against it.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Config file path, relative to the root unless absolute.
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingest / metadata service.
    Ingest,
    /// Run the scheduler / executor service.
    Scheduler,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Ingest => bootstrap::run_ingest(&cli.root, &cli.config).await,
        Command::Scheduler => bootstrap::run_scheduler(&cli.root, &cli.config).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Startup failures may precede logging init, so print too.
            eprintln!("downbeat: {e:#}");
            tracing::error!(error = %format!("{e:#}"), "service exited with error");
            ExitCode::FAILURE
        }
    }
}
