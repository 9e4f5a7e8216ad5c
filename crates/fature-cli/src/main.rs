//! Fature command-line tool.
//!
//! Runs migrations, validation, index rebuilds, monitoring and rollback
//! procedures against the configured store.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use fature_core::{Config, DatabaseConfig};

/// Fature migration and recovery toolkit
#[derive(Parser, Debug)]
#[command(name = "fature")]
#[command(version, about = "Fature migration and recovery toolkit")]
pub struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "FATURE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use this SQLite database instead of the configured store
    #[arg(long, env = "FATURE_SQLITE_PATH")]
    pub sqlite: Option<PathBuf>,

    /// Chat webhook that receives monitoring alerts
    #[arg(long, env = "FATURE_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Override the migration window size
    #[arg(long)]
    pub batch_size: Option<i64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Back up, migrate, index and validate
    Migrate,
    /// Run the consistency checks against the migrated data
    Validate,
    /// Rebuild the hierarchy index and counters
    RebuildIndex {
        /// Compute the closure in-process instead of in the store
        #[arg(long)]
        in_process: bool,
    },
    /// Collect metrics and raise alerts
    Monitor {
        /// Keep running until interrupted
        #[arg(long)]
        continuous: bool,

        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Snapshot the original tables
    Backup,
    /// Delete the pre-migration snapshots
    BackupDelete {
        /// Confirmation token; prompted for when absent
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Health check of the live system
    Check,
    /// Restore the original tables from their snapshots
    RollbackFull {
        /// Confirmation token; prompted for when absent
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Drop the derived schema only
    RollbackSchema,
    /// Drop the derived schema's triggers only
    RollbackTriggers,
    /// Show recent rollback activity
    Report {
        /// Rows to show
        #[arg(long)]
        limit: Option<u32>,
    },
}

impl Args {
    /// Load the configuration file, if any, and apply command-line overrides.
    pub fn into_config(&self) -> Result<Config, fature_core::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(path) = &self.sqlite {
            config = config.with_database(DatabaseConfig::sqlite(path));
        }
        if let Some(url) = &self.webhook_url {
            config = config.with_webhook_url(url);
        }
        if let Some(batch_size) = self.batch_size {
            config.migration = config.migration.with_batch_size(batch_size);
        }
        match &self.command {
            Command::Monitor {
                interval: Some(secs),
                ..
            } => {
                config.monitor = config.monitor.with_interval(Duration::from_secs(*secs));
            }
            Command::RebuildIndex { in_process: true } => {
                config.migration.in_process_closure = true;
            }
            _ => {}
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fature=info,fature_core=info".into()),
        )
        .init();

    let args = Args::parse();

    match commands::run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply() {
        let args = Args::parse_from([
            "fature",
            "--sqlite",
            "/tmp/legacy.db",
            "--batch-size",
            "250",
            "monitor",
            "--interval",
            "30",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.migration.batch_size, 250);
        assert_eq!(config.monitor.interval(), Duration::from_secs(30));
        assert!(matches!(config.database, DatabaseConfig::Sqlite { .. }));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = Args::parse_from(["fature", "--batch-size", "0", "migrate"]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_report_limit() {
        let args = Args::parse_from(["fature", "report", "--limit", "5"]);
        assert!(matches!(args.command, Command::Report { limit: Some(5) }));
    }
}
