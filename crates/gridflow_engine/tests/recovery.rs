//! Startup recovery over the in-memory store and cache.

use chrono::Utc;
use gridflow_db::OccurrenceFilter;
use gridflow_engine::{RecoveryConfig, StartupRecovery};
use gridflow_protocol::{channels, AlarmEvent, AlarmState, Severity};
use gridflow_sinks::MemoryCacheSink;
use gridflow_test_utils as tu;
use std::sync::Arc;
use std::time::Duration;

fn recovery_config() -> RecoveryConfig {
    RecoveryConfig {
        filter: OccurrenceFilter::default(),
        retry_attempts: 3,
        retry_delay: Duration::from_millis(10),
        batch_cap: 10_000,
    }
}

#[tokio::test]
async fn republishes_unacknowledged_active_alarms() {
    let store = Arc::new(tu::MemoryStore::new());
    // Two active, one acknowledged (with acknowledged_time set).
    store.add_occurrence(tu::active_occurrence(1));
    store.add_occurrence(tu::active_occurrence(2));
    let mut acked = tu::active_occurrence(3);
    acked.state = AlarmState::Acknowledged;
    acked.acknowledged_at = Some(Utc::now());
    acked.acknowledged_by = Some("op".into());
    store.add_occurrence(acked);

    // Rules so events can carry the alarm type.
    store.add_rule(tu::high_rule(1, 100, 80.0, 2.0));
    store.add_rule(tu::high_rule(2, 101, 80.0, 2.0));
    store.add_rule(tu::high_rule(3, 102, 80.0, 2.0));

    let cache = Arc::new(MemoryCacheSink::new());
    let recovery = StartupRecovery::new(store, cache.clone());
    let stats = recovery.run(&recovery_config()).await.unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.successfully_published, 2);
    assert_eq!(stats.invalid, 1);
    assert_eq!(stats.failed, 0);

    let published = cache.published_on(channels::ALARM_EVENT);
    assert_eq!(published.len(), 2);
    let event: AlarmEvent = serde_json::from_str(&published[0]).unwrap();
    assert_eq!(event.state, AlarmState::Active);
    assert_eq!(event.alarm_type, "analog");

    let (current, total) = recovery.progress();
    assert_eq!((current, total), (3, 3));
}

#[tokio::test]
async fn publish_failures_are_retried_then_counted() {
    let store = Arc::new(tu::MemoryStore::new());
    store.add_occurrence(tu::active_occurrence(1));
    store.add_rule(tu::high_rule(1, 100, 80.0, 2.0));

    // Two failures, then success: retries inside one alarm's budget.
    let cache = Arc::new(tu::FlakyCacheSink::failing(2));
    let recovery = StartupRecovery::new(store.clone(), cache.clone());
    let stats = recovery.run(&recovery_config()).await.unwrap();
    assert_eq!(stats.successfully_published, 1);
    assert_eq!(stats.failed, 0);

    // More failures than the retry budget: the alarm counts as failed.
    let cache = Arc::new(tu::FlakyCacheSink::failing(5));
    let recovery = StartupRecovery::new(store, cache);
    let stats = recovery.run(&recovery_config()).await.unwrap();
    assert_eq!(stats.successfully_published, 0);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn cancel_stops_midway() {
    let store = Arc::new(tu::MemoryStore::new());
    for rule in 1..=50 {
        store.add_occurrence(tu::active_occurrence(rule));
    }
    let cache = Arc::new(MemoryCacheSink::new());
    let recovery = StartupRecovery::new(store, cache);
    recovery.cancel();
    let stats = recovery.run(&recovery_config()).await.unwrap();
    assert!(stats.cancelled);
    assert_eq!(stats.successfully_published, 0);
}

#[tokio::test]
async fn severity_filter_limits_recovery() {
    let store = Arc::new(tu::MemoryStore::new());
    let mut low = tu::active_occurrence(1);
    low.severity = Severity::Low;
    store.add_occurrence(low);
    let mut critical = tu::active_occurrence(2);
    critical.severity = Severity::Critical;
    store.add_occurrence(critical);

    let cache = Arc::new(MemoryCacheSink::new());
    let recovery = StartupRecovery::new(store, cache.clone());
    let stats = recovery
        .run(&RecoveryConfig {
            filter: OccurrenceFilter { min_severity: Some(Severity::High), ..Default::default() },
            ..recovery_config()
        })
        .await
        .unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.successfully_published, 1);
    let published = cache.published_on(channels::ALARM_EVENT);
    let event: AlarmEvent = serde_json::from_str(&published[0]).unwrap();
    assert_eq!(event.severity, Severity::Critical);
}
