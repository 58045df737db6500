//! Alarm startup recovery.
//!
//! Before the pipeline accepts new data, active occurrences from the durable
//! store are republished on the alarm channel so downstream consumers
//! rebuild their view after a restart. Publication retries a bounded number
//! of times per alarm; progress is observable and the run can be paused,
//! resumed, or cancelled.

use crate::error::Result;
use gridflow_db::{OccurrenceFilter, RelationalStore};
use gridflow_protocol::defaults::{
    RECOVERY_BATCH_CAP, RECOVERY_RETRY_ATTEMPTS, RECOVERY_RETRY_DELAY_MS,
};
use gridflow_sinks::CacheSink;
use gridflow_protocol::{
    channels, AlarmEvent, AlarmOccurrence, AlarmRule, AlarmState, AlarmTarget, OccurrenceId,
    PointRef, RuleId, TenantId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tuning knobs for one recovery run.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub filter: OccurrenceFilter,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub batch_cap: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            filter: OccurrenceFilter::default(),
            retry_attempts: RECOVERY_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(RECOVERY_RETRY_DELAY_MS),
            batch_cap: RECOVERY_BATCH_CAP,
        }
    }
}

/// Outcome of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub successfully_published: usize,
    pub invalid: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub cancelled: bool,
}

pub struct StartupRecovery {
    store: Arc<dyn RelationalStore>,
    cache: Arc<dyn CacheSink>,
    paused: AtomicBool,
    cancelled: AtomicBool,
    current: AtomicUsize,
    total: AtomicUsize,
}

impl StartupRecovery {
    pub fn new(store: Arc<dyn RelationalStore>, cache: Arc<dyn CacheSink>) -> Self {
        Self {
            store,
            cache,
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            current: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `(current_index, total)` of the running (or finished) pass.
    pub fn progress(&self) -> (usize, usize) {
        (self.current.load(Ordering::SeqCst), self.total.load(Ordering::SeqCst))
    }

    /// Run one recovery pass.
    pub async fn run(&self, config: &RecoveryConfig) -> Result<RecoveryStats> {
        let mut filter = config.filter.clone();
        filter.limit = Some(filter.limit.unwrap_or(config.batch_cap).min(config.batch_cap));
        let occurrences = self.store.load_open_occurrences(&filter).await?;

        let mut stats = RecoveryStats { total: occurrences.len(), ..Default::default() };
        self.total.store(occurrences.len(), Ordering::SeqCst);
        self.current.store(0, Ordering::SeqCst);
        info!("Alarm recovery: {} occurrences to examine", occurrences.len());

        let mut rules: HashMap<TenantId, HashMap<RuleId, AlarmRule>> = HashMap::new();
        let mut seen: HashSet<OccurrenceId> = HashSet::new();

        for (index, occ) in occurrences.iter().enumerate() {
            self.current.store(index + 1, Ordering::SeqCst);

            if self.cancelled.load(Ordering::SeqCst) {
                stats.cancelled = true;
                warn!("Alarm recovery cancelled at {}/{}", index, stats.total);
                break;
            }
            while self.paused.load(Ordering::SeqCst) && !self.cancelled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            if !seen.insert(occ.id) {
                stats.duplicates += 1;
                continue;
            }
            // Only unacknowledged active alarms are republished.
            if occ.state != AlarmState::Active || occ.acknowledged_at.is_some() {
                stats.invalid += 1;
                continue;
            }

            let rule = self.rule_for(&mut rules, occ).await;
            let event = build_event(occ, rule);
            if self.publish_with_retry(&event, config).await {
                stats.successfully_published += 1;
            } else {
                stats.failed += 1;
            }
        }

        info!(
            "Alarm recovery done: {}/{} published, {} invalid, {} failed",
            stats.successfully_published, stats.total, stats.invalid, stats.failed
        );
        Ok(stats)
    }

    async fn rule_for<'a>(
        &self,
        cache: &'a mut HashMap<TenantId, HashMap<RuleId, AlarmRule>>,
        occ: &AlarmOccurrence,
    ) -> Option<&'a AlarmRule> {
        if !cache.contains_key(&occ.tenant_id) {
            let loaded = match self.store.load_rules(occ.tenant_id).await {
                Ok(rules) => rules.into_iter().map(|r| (r.id, r)).collect(),
                Err(e) => {
                    warn!("Recovery could not load rules for tenant {}: {e}", occ.tenant_id);
                    HashMap::new()
                }
            };
            cache.insert(occ.tenant_id, loaded);
        }
        cache.get(&occ.tenant_id).and_then(|m| m.get(&occ.rule_id))
    }

    async fn publish_with_retry(&self, event: &AlarmEvent, config: &RecoveryConfig) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!("Recovery could not serialise occurrence {}: {e}", event.occurrence_id);
                return false;
            }
        };
        for attempt in 1..=config.retry_attempts.max(1) {
            match self.cache.publish(channels::ALARM_EVENT, payload.clone()).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        "Recovery publish for occurrence {} attempt {attempt}: {e}",
                        event.occurrence_id
                    );
                    if attempt < config.retry_attempts {
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }
        false
    }
}

fn build_event(occ: &AlarmOccurrence, rule: Option<&AlarmRule>) -> AlarmEvent {
    let (alarm_type, device_id, point_id, source_name) = match rule {
        Some(rule) => {
            let (device_id, point_id) = match &rule.target {
                AlarmTarget::Device(id) => (Some(*id), None),
                AlarmTarget::DataPoint(id) => (None, Some(PointRef::DataPoint(*id))),
                AlarmTarget::VirtualPoint(id) => (None, Some(PointRef::VirtualPoint(*id))),
                AlarmTarget::Group(_) => (None, None),
            };
            (rule.params.type_name().to_string(), device_id, point_id, Some(rule.name.clone()))
        }
        None => ("unknown".to_string(), None, None, None),
    };
    AlarmEvent {
        occurrence_id: occ.id,
        rule_id: occ.rule_id,
        tenant_id: occ.tenant_id,
        device_id,
        point_id,
        severity: occ.severity,
        state: occ.state,
        alarm_type,
        message: occ.message.clone(),
        trigger_value: occ.trigger_value.clone(),
        threshold_value: None,
        trigger_condition: occ.condition.clone(),
        occurrence_time: occ.occurred_at,
        cleared_value: occ.cleared_value.clone(),
        source_name,
        location: None,
    }
}
