//! Command implementations.
//!
//! Each command returns `Ok(true)` on success or a healthy system and
//! `Ok(false)` when it ran but found a problem.

use std::io::{self, BufRead, Write};
use std::sync::mpsc;

use fature_core::{
    open_store, BackupManager, Config, ConsistencyValidator, HealthCheck, HierarchyIndexBuilder,
    MigrationPipeline, Monitor, RollbackOrchestrator, RollbackReport, Store,
};

use crate::{Args, Command};

type CmdResult = Result<bool, Box<dyn std::error::Error>>;

/// Token the operator must type before a full rollback.
const ROLLBACK_TOKEN: &str = "CONFIRM ROLLBACK";

/// Token the operator must type before snapshots are deleted.
const DELETE_BACKUPS_TOKEN: &str = "DELETE BACKUPS";

pub fn run(args: &Args) -> CmdResult {
    let config = args.into_config()?;
    tracing::debug!(database = ?config.database, "configuration loaded");

    let mut store = open_store(&config.database)?;
    let store = &mut *store;
    tracing::info!(backend = store.backend_name(), "store opened");

    match &args.command {
        Command::Migrate => migrate(&config, store),
        Command::Validate => validate(&config, store),
        Command::RebuildIndex { .. } => rebuild_index(&config, store),
        Command::Monitor { continuous, .. } => monitor(&config, store, *continuous),
        Command::Backup => backup(store),
        Command::BackupDelete { confirm } => backup_delete(store, confirm.as_deref()),
        Command::Check => check(&config, store),
        Command::RollbackFull { confirm } => rollback_full(&config, store, confirm.as_deref()),
        Command::RollbackSchema => {
            RollbackOrchestrator::new(config.rollback.clone()).rollback_schema_only(store)?;
            println!("derived schema dropped");
            Ok(true)
        }
        Command::RollbackTriggers => {
            let outcome =
                RollbackOrchestrator::new(config.rollback.clone()).rollback_triggers_only(store)?;
            if let Some(details) = outcome.steps.last().and_then(|r| r.details.as_deref()) {
                println!("{details}");
            }
            Ok(true)
        }
        Command::Report { limit } => {
            let limit = limit.unwrap_or(config.rollback.report_limit);
            println!("{}", RollbackReport::load(store, limit)?);
            Ok(true)
        }
    }
}

fn migrate(config: &Config, store: &mut dyn Store) -> CmdResult {
    let report = MigrationPipeline::new(config.clone()).run(store)?;

    println!(
        "migrated {}/{} entities in {} batches ({} failed)",
        report.migration.total_succeeded,
        report.migration.total_processed,
        report.migration.batches.len(),
        report.migration.total_failed
    );
    for failure in report.migration.failures() {
        println!("  entity {}: {}", failure.id, failure.reason);
    }
    println!(
        "indexed {} entities, {} edges, depth {}",
        report.index.entities_indexed, report.index.edges_created, report.index.max_depth
    );
    println!("{}", report.validation);
    println!("elapsed: {:.1}s", report.elapsed.as_secs_f64());
    Ok(report.succeeded())
}

fn validate(config: &Config, store: &mut dyn Store) -> CmdResult {
    let report = ConsistencyValidator::from_config(&config.validation).validate(store)?;
    println!("{report}");
    Ok(report.passed())
}

fn rebuild_index(config: &Config, store: &mut dyn Store) -> CmdResult {
    let stats = HierarchyIndexBuilder::from_config(&config.migration).build(store)?;
    println!(
        "indexed {} entities, {} edges, depth {} in {}ms",
        stats.entities_indexed,
        stats.edges_created,
        stats.max_depth,
        stats.elapsed.as_millis()
    );
    Ok(true)
}

fn monitor(config: &Config, store: &mut dyn Store, continuous: bool) -> CmdResult {
    let monitor = Monitor::new(config.monitor.clone());
    if !continuous {
        let outcome = monitor.run_once(store)?;
        for alert in &outcome.alerts {
            println!("{:<8} {:<20} {}", alert.level, alert.kind, alert.message);
        }
        return Ok(outcome.is_healthy());
    }

    let (tx, rx) = mpsc::channel();
    // Held until the loop returns so the receiver never sees a disconnect.
    let _keepalive = tx.clone();
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = %e, "failed to start signal runtime");
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl+c");
                return;
            }
            tracing::info!("received shutdown signal");
            let _ = tx.send(());
        });
    });

    monitor.run_continuous(store, &rx);
    Ok(true)
}

fn backup(store: &mut dyn Store) -> CmdResult {
    let report = BackupManager::new().create_backups(store)?;
    for (table, rows) in &report.created {
        println!("created backup of {table} ({rows} rows)");
    }
    for table in &report.kept {
        println!("kept existing backup of {table}");
    }
    for (table, error) in &report.failed {
        println!("backup of {table} failed: {error}");
    }
    Ok(report.failed.is_empty())
}

fn backup_delete(store: &mut dyn Store, confirm: Option<&str>) -> CmdResult {
    let warning = "Deleting the pre-migration snapshots makes a full rollback impossible.";
    if !confirmed(confirm, DELETE_BACKUPS_TOKEN, warning)? {
        println!("backup deletion cancelled");
        return Ok(true);
    }

    let dropped = BackupManager::new().delete_backups(store)?;
    if dropped.is_empty() {
        println!("no backups to delete");
    }
    for table in dropped {
        println!("deleted backup of {table}");
    }
    Ok(true)
}

fn check(config: &Config, store: &mut dyn Store) -> CmdResult {
    let report = HealthCheck::from_config(&config.rollback).check(store);
    println!("{report}");
    Ok(report.is_healthy())
}

fn rollback_full(config: &Config, store: &mut dyn Store, confirm: Option<&str>) -> CmdResult {
    let warning = "A full rollback replaces the original tables with their pre-migration snapshots.";
    if !confirmed(confirm, ROLLBACK_TOKEN, warning)? {
        println!("rollback cancelled");
        return Ok(true);
    }

    let outcome = RollbackOrchestrator::new(config.rollback.clone()).full_rollback(store)?;
    for (table, rows) in &outcome.restored {
        println!("restored {table} ({rows} rows)");
    }
    for step in &outcome.failed_steps {
        println!("FAILED: {step}");
    }
    if let Some(error) = &outcome.cleanup_error {
        println!("derived schema cleanup failed: {error}");
    }
    Ok(outcome.is_clean())
}

/// Check `given` against `token`, prompting on stdin when nothing was given.
fn confirmed(given: Option<&str>, token: &str, warning: &str) -> io::Result<bool> {
    let answer = match given {
        Some(answer) => answer.to_string(),
        None => {
            println!("{warning}");
            print!("Type '{token}' to continue: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line
        }
    };
    Ok(answer.trim() == token)
}
