mod common;

use chrono::{Duration, Utc};
use common::{add_pending_commissions, fast_migration, small_tree};
use fature_core::{
    Alert, AlertKind, AlertLevel, AlertState, BatchMigrator, Monitor, MonitorConfig, Notifier,
    NotifyError, SqliteStore, Store,
};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct Inbox(Arc<Mutex<Vec<Alert>>>);

impl Notifier for Inbox {
    fn name(&self) -> &'static str {
        "inbox"
    }

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

fn migrated() -> SqliteStore {
    let mut store = small_tree();
    store.create_derived_schema().unwrap();
    BatchMigrator::new(fast_migration(10)).run(&mut store).unwrap();
    store
}

/// Run one cycle against `pending` commissions with a ceiling of 5 and
/// the default critical multiple of 10.
fn backlog_alerts(pending: i64) -> Vec<Alert> {
    let mut store = migrated();
    add_pending_commissions(&store, pending);

    let mut config = MonitorConfig::default();
    config.thresholds.max_pending_commissions = 5;
    config.thresholds.min_throughput_per_second = 0.0;
    let inbox = Inbox::default();
    let monitor = Monitor::new(config).with_notifier(Box::new(inbox.clone()));

    let outcome = monitor.run_once(&mut store).unwrap();
    assert_eq!(outcome.metrics.commissions.pending, pending as u64);
    assert_eq!(outcome.metrics.entities.total, 4);

    let sent = inbox.0.lock().unwrap().clone();
    sent
}

#[test]
fn test_backlog_escalates_to_critical() {
    let sent = backlog_alerts(60);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, AlertKind::CommissionBacklog);
    assert_eq!(sent[0].level, AlertLevel::Critical);
    assert_eq!(sent[0].threshold, 5.0);
}

#[test]
fn test_backlog_at_critical_line_is_a_warning() {
    let sent = backlog_alerts(50);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].level, AlertLevel::Warning);

    assert_eq!(backlog_alerts(51)[0].level, AlertLevel::Critical);
    assert!(backlog_alerts(5).is_empty());
}

#[test]
fn test_alert_cooldown_across_cycles() {
    let mut store = migrated();
    let inbox = Inbox::default();
    let monitor = Monitor::new(MonitorConfig::default()).with_notifier(Box::new(inbox.clone()));
    let t0 = Utc::now();

    let mut state = AlertState::new();
    let mut dispatched = Vec::new();
    for minutes in [0, 5, 10, 16] {
        let outcome = monitor
            .run_cycle(&mut store, &state, t0 + Duration::minutes(minutes))
            .unwrap();
        dispatched.push(outcome.dispatched.len());
        state = outcome.next_state;
    }

    assert_eq!(dispatched, vec![1, 0, 0, 1]);
    assert!(inbox
        .0
        .lock()
        .unwrap()
        .iter()
        .all(|alert| alert.kind == AlertKind::LowThroughput));
}

#[test]
fn test_quiet_system_is_healthy() {
    let mut store = migrated();
    let mut config = MonitorConfig::default();
    config.thresholds.min_throughput_per_second = 0.0;
    let monitor = Monitor::new(config).with_notifier(Box::new(Inbox::default()));

    let outcome = monitor.run_once(&mut store).unwrap();
    assert!(outcome.is_healthy());
    assert!(outcome.metrics.system.database_size_bytes > 0);
    assert_eq!(
        outcome.metrics.system.hierarchy_relationships,
        store.hierarchy_edges().unwrap().len() as u64
    );
}
