//! kubedr CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

use kubedr_common::telemetry::TelemetryConfig;

/// kubedr - disaster recovery for databases and volumes on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kubedr")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit JSON logs
    #[arg(long, global = true, env = "KUBEDR_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Back up database clusters and volumes to object storage
    Backup(commands::backup::BackupArgs),
    /// Restore database clusters from a backup event
    Restore(commands::restore::RestoreArgs),
}

impl Cli {
    /// Telemetry settings for this invocation
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            json: self.log_json,
            ..Default::default()
        }
    }

    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Backup(args) => commands::backup::run(args).await,
            Commands::Restore(args) => commands::restore::run(args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn restore_requires_a_cluster() {
        let err = Cli::try_parse_from([
            "kubedr",
            "restore",
            "--worker-image",
            "kubedr/worker:1",
            "--issuer",
            "pg-ca",
            "--remote-url",
            "s3://dr-bucket",
            "--credentials-secret",
            "s3-creds",
            "--event",
            "nightly-2026-10-16t02-00-00z",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
