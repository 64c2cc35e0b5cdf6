//! kubedr CLI
//!
//! Runs one backup or restore recipe against the current cluster.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use kubedr_cli::Cli;
use kubedr_common::telemetry::{init_telemetry, shutdown_telemetry};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_telemetry(cli.telemetry_config()) {
        eprintln!("kubedr: {}", e);
        return ExitCode::FAILURE;
    }

    let result = cli.run().await;
    if let Err(e) = &result {
        // Display carries the whole causal chain and every aggregated failure
        error!(error = %e, "kubedr failed");
    }
    shutdown_telemetry();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
