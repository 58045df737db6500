//! Alarm engine.
//!
//! Rules are cached by `(tenant, target)`; each rule carries its own state
//! block behind a mutex, so transitions for one rule are serialised no matter
//! which processing thread evaluates it. Evaluation is two-phase: state
//! transitions happen synchronously under the rule mutex (keeping the
//! one-open-occurrence invariant), then occurrences are persisted with
//! bounded retries and events are built. A failed persist never swallows the
//! event: pub/sub is the operator-visible signal.

pub mod analog;
pub mod digital;
pub mod stats;
pub mod suppression;

use crate::current::CurrentValueStore;
use crate::error::{EngineError, Result};
use crate::metrics::METRICS;
use analog::AlarmLevel;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use digital::DigitalOutcome;
use gridflow_db::{OccurrenceUpdate, RelationalStore};
use gridflow_protocol::defaults::PERSIST_RETRY_ATTEMPTS;
use gridflow_script::CompiledScript;
use gridflow_protocol::{
    AlarmEvent, AlarmOccurrence, AlarmRule, AlarmState, AlarmTarget, BadReason, DeviceId,
    OccurrenceId, PointRef, Quality, RuleId, RuleParams, Severity, TenantId, TimestampedValue,
    Value,
};
use parking_lot::{Mutex, RwLock};
use stats::{AlarmStats, AlarmStatsSnapshot};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use suppression::SuppressionPolicy;
use tracing::{debug, error, info, warn};

/// Escalation: this many fires within the window bumps severity one step.
const ESCALATION_FIRE_COUNT: usize = 3;
const ESCALATION_WINDOW_MINS: i64 = 60;
const PERSIST_RETRY_DELAY_MS: u64 = 50;

/// Display metadata for a point, used for device-target rule lookup, script
/// variable resolution by name, and event enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct PointMeta {
    pub point: PointRef,
    pub tenant: TenantId,
    pub name: String,
    pub device_id: Option<DeviceId>,
    pub location: Option<String>,
    pub group: Option<String>,
}

#[derive(Default)]
struct RuleState {
    level: AlarmLevel,
    last_value: Option<f64>,
    last_ts: Option<DateTime<Utc>>,
    last_bool: Option<bool>,
    /// The open occurrence, if any. At most one at all times.
    open: Option<AlarmOccurrence>,
    /// Underlying condition recovered while latched / not auto-clearing.
    condition_recovered: bool,
    /// Fire timestamps inside the escalation window.
    recent_fires: VecDeque<DateTime<Utc>>,
}

struct RuleEntry {
    rule: AlarmRule,
    script: Option<CompiledScript>,
    message_script: Option<CompiledScript>,
    suppression: Option<SuppressionPolicy>,
    /// Operator-requested suppression deadline.
    temp_suppress_until: Mutex<Option<DateTime<Utc>>>,
    /// Store id of the most recently persisted occurrence; lets a clear that
    /// was decided before the create committed (pulse rules) find its row.
    last_persisted_id: Mutex<Option<OccurrenceId>>,
    state: Mutex<RuleState>,
}

type RuleKey = (TenantId, AlarmTarget);

/// A state transition decided under the rule mutex, persisted afterwards.
enum Pending {
    Create {
        entry: Arc<RuleEntry>,
        occurrence: AlarmOccurrence,
        threshold: Option<f64>,
        publish: bool,
    },
    Update {
        entry: Arc<RuleEntry>,
        occurrence: AlarmOccurrence,
        fields: OccurrenceUpdate,
        threshold: Option<f64>,
        publish: bool,
    },
}

pub struct AlarmEngine {
    store: Arc<dyn RelationalStore>,
    by_target: RwLock<HashMap<RuleKey, Vec<Arc<RuleEntry>>>>,
    by_id: RwLock<HashMap<RuleId, Arc<RuleEntry>>>,
    meta: RwLock<HashMap<PointRef, PointMeta>>,
    name_index: RwLock<HashMap<(TenantId, String), PointRef>>,
    open_index: DashMap<OccurrenceId, RuleId>,
    stats: AlarmStats,
    last_auto_check: Mutex<DateTime<Utc>>,
}

impl AlarmEngine {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self {
            store,
            by_target: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            meta: RwLock::new(HashMap::new()),
            name_index: RwLock::new(HashMap::new()),
            open_index: DashMap::new(),
            stats: AlarmStats::new(),
            last_auto_check: Mutex::new(Utc::now()),
        }
    }

    // ------------------------------------------------------------------
    // Rule cache
    // ------------------------------------------------------------------

    /// Compile and install one rule, replacing any previous version.
    pub fn install_rule(&self, rule: AlarmRule) -> Result<()> {
        let (script, message_script) = match &rule.params {
            RuleParams::Script { condition, message_script } => {
                let script = CompiledScript::compile(condition).map_err(|e| {
                    EngineError::InvalidRule { rule: rule.id, reason: e.to_string() }
                })?;
                let message_script = message_script
                    .as_deref()
                    .map(CompiledScript::compile)
                    .transpose()
                    .map_err(|e| EngineError::InvalidRule { rule: rule.id, reason: e.to_string() })?;
                (Some(script), message_script)
            }
            _ => (None, None),
        };
        let suppression = rule
            .suppression
            .as_ref()
            .map(SuppressionPolicy::parse)
            .transpose()
            .map_err(|e| EngineError::InvalidRule { rule: rule.id, reason: e.to_string() })?
            .filter(|p| !p.is_empty());

        let entry = Arc::new(RuleEntry {
            rule,
            script,
            message_script,
            suppression,
            temp_suppress_until: Mutex::new(None),
            last_persisted_id: Mutex::new(None),
            state: Mutex::new(RuleState::default()),
        });

        self.remove_rule(entry.rule.id);
        if entry.rule.enabled {
            let key = (entry.rule.tenant_id, entry.rule.target.clone());
            self.by_target.write().entry(key).or_default().push(Arc::clone(&entry));
        }
        self.by_id.write().insert(entry.rule.id, entry);
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: RuleId) {
        let removed = self.by_id.write().remove(&rule_id);
        if let Some(entry) = removed {
            let key = (entry.rule.tenant_id, entry.rule.target.clone());
            let mut by_target = self.by_target.write();
            if let Some(list) = by_target.get_mut(&key) {
                list.retain(|e| e.rule.id != rule_id);
                if list.is_empty() {
                    by_target.remove(&key);
                }
            }
        }
    }

    /// Load (or reload) every rule for a tenant from the store.
    pub async fn load_tenant(&self, tenant: TenantId) -> Result<usize> {
        let rules = self.store.load_rules(tenant).await?;
        let mut installed = 0;
        for rule in rules {
            let id = rule.id;
            match self.install_rule(rule) {
                Ok(()) => installed += 1,
                Err(e) => warn!("Skipping rule {id}: {e}"),
            }
        }
        info!("Loaded {installed} alarm rules for tenant {tenant}");
        Ok(installed)
    }

    /// Re-read a single rule from the store.
    pub async fn reload_rule(&self, tenant: TenantId, rule_id: RuleId) -> Result<()> {
        let rules = self.store.load_rules(tenant).await?;
        match rules.into_iter().find(|r| r.id == rule_id) {
            Some(rule) => self.install_rule(rule),
            None => {
                self.remove_rule(rule_id);
                Ok(())
            }
        }
    }

    pub fn rule_count(&self) -> usize {
        self.by_id.read().len()
    }

    /// Install point metadata (names, owning devices, locations, groups).
    pub fn set_point_meta(&self, metas: Vec<PointMeta>) {
        let mut meta = self.meta.write();
        let mut names = self.name_index.write();
        for m in metas {
            names.insert((m.tenant, m.name.clone()), m.point);
            meta.insert(m.point, m);
        }
    }

    pub fn stats(&self) -> AlarmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot of open occurrences across all rules.
    pub fn open_occurrences(&self) -> Vec<AlarmOccurrence> {
        self.by_id
            .read()
            .values()
            .filter_map(|entry| entry.state.lock().open.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluate the merged batch, returning alarm events to publish.
    pub async fn evaluate_batch(
        &self,
        values: &[TimestampedValue],
        current: &CurrentValueStore,
    ) -> Vec<AlarmEvent> {
        let started = std::time::Instant::now();

        // Last write per point wins for script/gate lookups.
        let mut overlay: HashMap<PointRef, Value> = HashMap::with_capacity(values.len());
        for tv in values {
            overlay.insert(tv.point, tv.value.clone());
        }

        let mut pending: Vec<Pending> = Vec::new();
        for tv in values {
            for entry in self.rules_for(tv) {
                self.stats.evaluations.fetch_add(1, Ordering::Relaxed);
                self.evaluate_rule(&entry, tv, &overlay, current, &mut pending);
            }
        }
        self.evaluate_compound_rules(&overlay, current, &mut pending);
        self.auto_acknowledge_tick(&mut pending);

        let mut events = Vec::with_capacity(pending.len());
        for p in pending {
            if let Some(event) = self.commit(p).await {
                events.push(event);
            }
        }

        self.stats
            .eval_time_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        events
    }

    /// Rules watching this value: its own point target plus its device.
    fn rules_for(&self, tv: &TimestampedValue) -> Vec<Arc<RuleEntry>> {
        let by_target = self.by_target.read();
        let mut out = Vec::new();
        let point_target = match tv.point {
            PointRef::DataPoint(id) => AlarmTarget::DataPoint(id),
            PointRef::VirtualPoint(id) => AlarmTarget::VirtualPoint(id),
        };
        if let Some(list) = by_target.get(&(tv.tenant_id, point_target)) {
            out.extend(list.iter().cloned());
        }
        let meta = self.meta.read();
        if let Some(m) = meta.get(&tv.point) {
            if let Some(device_id) = m.device_id {
                if let Some(list) = by_target.get(&(tv.tenant_id, AlarmTarget::Device(device_id))) {
                    out.extend(list.iter().cloned());
                }
            }
            if let Some(group) = &m.group {
                if let Some(list) =
                    by_target.get(&(tv.tenant_id, AlarmTarget::Group(group.clone())))
                {
                    out.extend(list.iter().cloned());
                }
            }
        }
        out
    }

    fn evaluate_rule(
        &self,
        entry: &Arc<RuleEntry>,
        tv: &TimestampedValue,
        overlay: &HashMap<PointRef, Value>,
        current: &CurrentValueStore,
        pending: &mut Vec<Pending>,
    ) {
        let usable_quality = !tv.quality.is_bad();
        match &entry.rule.params {
            RuleParams::Analog(params) => {
                if !usable_quality {
                    return;
                }
                let Some(v) = tv.value.as_f64() else { return };
                let mut state = entry.state.lock();

                let rate_hit = match (state.last_value, state.last_ts) {
                    (Some(prev_v), Some(prev_ts)) => {
                        let dt = (tv.source_timestamp - prev_ts).num_milliseconds() as f64 / 1_000.0;
                        analog::rate_exceeded(params, v, prev_v, dt)
                    }
                    _ => false,
                };
                let prev_level = state.level;
                let mut level = analog::evaluate(params, v, prev_level);
                if level == AlarmLevel::Normal && rate_hit {
                    level = AlarmLevel::RateOfChange;
                }
                state.last_value = Some(v);
                state.last_ts = Some(tv.source_timestamp);
                // A suppressed occurrence whose level holds still re-arms
                // the moment its suppression lifts.
                if level.is_alarm() && state.open.is_some() {
                    self.reactivate_if_unsuppressed(entry, &mut state, tv.tenant_id, overlay, current, pending);
                }
                if level == prev_level {
                    return;
                }
                state.level = level;

                if level.is_alarm() {
                    let threshold = analog::threshold_for(params, level);
                    if state.open.is_none() {
                        self.fire(entry, &mut state, tv, level.condition_tag(), threshold, None, None, overlay, current, pending);
                    } else if let Some(open) = state.open.as_mut() {
                        // Escalation within one occurrence (high -> high_high).
                        open.condition = level.condition_tag().to_string();
                        let publish = open.state != AlarmState::Suppressed;
                        let occurrence = open.clone();
                        pending.push(Pending::Update {
                            entry: Arc::clone(entry),
                            occurrence,
                            fields: OccurrenceUpdate::default(),
                            threshold,
                            publish,
                        });
                    }
                } else {
                    self.recover(entry, &mut state, tv, pending);
                }
            }
            RuleParams::Digital { trigger } => {
                if !usable_quality {
                    return;
                }
                let s = tv.value.as_bool();
                let mut state = entry.state.lock();
                let outcome = digital::evaluate(*trigger, s, state.last_bool);
                state.last_bool = Some(s);
                match outcome {
                    DigitalOutcome::Fire(tag) => {
                        if state.open.is_none() {
                            self.fire(entry, &mut state, tv, tag, None, None, None, overlay, current, pending);
                        } else {
                            self.reactivate_if_unsuppressed(entry, &mut state, tv.tenant_id, overlay, current, pending);
                        }
                    }
                    DigitalOutcome::Clear => self.recover(entry, &mut state, tv, pending),
                    DigitalOutcome::Pulse(tag) => {
                        if state.open.is_none() {
                            self.fire(entry, &mut state, tv, tag, None, None, None, overlay, current, pending);
                            self.recover(entry, &mut state, tv, pending);
                        }
                    }
                    DigitalOutcome::None => {}
                }
            }
            RuleParams::Script { .. } => {
                if !usable_quality {
                    return;
                }
                let Some(script) = entry.script.as_ref() else { return };
                let bindings = self.script_bindings(entry, script, tv, overlay, current);
                let Some(bindings) = bindings else { return };
                let refs: Vec<(&str, Value)> =
                    bindings.iter().map(|(n, v)| (n.as_str(), v.clone())).collect();
                match script.eval_condition(&refs) {
                    Ok(outcome) => {
                        let mut state = entry.state.lock();
                        if outcome.triggered {
                            if state.open.is_none() {
                                let severity = outcome
                                    .severity
                                    .as_deref()
                                    .and_then(|s| s.parse::<Severity>().ok());
                                // Message precedence: condition-script tuple,
                                // then the rule's message script, then the
                                // template.
                                let message = outcome.message.or_else(|| {
                                    entry.message_script.as_ref().and_then(|ms| {
                                        ms.eval_value(&refs, gridflow_protocol::ValueType::Text)
                                            .ok()
                                            .map(|v| v.to_string())
                                    })
                                });
                                self.fire(
                                    entry, &mut state, tv, "script", None,
                                    message, severity, overlay, current, pending,
                                );
                            } else {
                                self.reactivate_if_unsuppressed(entry, &mut state, tv.tenant_id, overlay, current, pending);
                            }
                        } else {
                            self.recover(entry, &mut state, tv, pending);
                        }
                    }
                    Err(e) => {
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        debug!("rule {} script error: {e}", entry.rule.id);
                    }
                }
            }
            RuleParams::Communication => {
                let firing = matches!(
                    tv.quality,
                    Quality::Bad(BadReason::CommFailure) | Quality::Bad(BadReason::NotConnected)
                );
                let mut state = entry.state.lock();
                if firing {
                    if state.open.is_none() {
                        self.fire(entry, &mut state, tv, "communication", None, None, None, overlay, current, pending);
                    }
                } else if tv.quality.is_good() {
                    self.recover(entry, &mut state, tv, pending);
                }
            }
            RuleParams::Quality => {
                let mut state = entry.state.lock();
                if tv.quality.is_bad() {
                    if state.open.is_none() {
                        self.fire(entry, &mut state, tv, "quality", None, None, None, overlay, current, pending);
                    }
                } else if tv.quality.is_good() {
                    self.recover(entry, &mut state, tv, pending);
                }
            }
            // Compound rules are evaluated once per batch, not per value.
            RuleParams::Compound { .. } => {}
        }
    }

    /// Bindings for a script rule: `value`, `last_value`, `last_state`, and
    /// any other variable resolved as a point name within the tenant.
    fn script_bindings(
        &self,
        entry: &RuleEntry,
        script: &CompiledScript,
        tv: &TimestampedValue,
        overlay: &HashMap<PointRef, Value>,
        current: &CurrentValueStore,
    ) -> Option<Vec<(String, Value)>> {
        let name_index = self.name_index.read();
        let mut bindings: Vec<(String, Value)> = Vec::with_capacity(script.variables().len());
        for var in script.variables() {
            let value = match var.as_str() {
                "value" => Some(tv.value.clone()),
                "last_value" => {
                    let state = entry.state.lock();
                    Some(state.last_value.map(Value::Float).unwrap_or(Value::Float(0.0)))
                }
                "last_state" => {
                    let state = entry.state.lock();
                    Some(Value::Bool(state.last_bool.unwrap_or(false)))
                }
                name => name_index
                    .get(&(tv.tenant_id, name.to_string()))
                    .and_then(|point| {
                        overlay.get(point).cloned().or_else(|| current.value(tv.tenant_id, *point))
                    }),
            };
            match value {
                Some(v) => bindings.push((var.clone(), v)),
                None => {
                    debug!("rule {} has no binding for '{var}' yet", entry.rule.id);
                    return None;
                }
            }
        }
        // Record history for the next evaluation.
        {
            let mut state = entry.state.lock();
            state.last_value = tv.value.as_f64();
            state.last_bool = Some(tv.value.as_bool());
            state.last_ts = Some(tv.source_timestamp);
        }
        Some(bindings)
    }

    fn evaluate_compound_rules(
        &self,
        overlay: &HashMap<PointRef, Value>,
        current: &CurrentValueStore,
        pending: &mut Vec<Pending>,
    ) {
        let compounds: Vec<Arc<RuleEntry>> = self
            .by_id
            .read()
            .values()
            .filter(|e| matches!(e.rule.params, RuleParams::Compound { .. }))
            .cloned()
            .collect();
        if compounds.is_empty() {
            return;
        }
        for entry in compounds {
            let RuleParams::Compound { require_all, rules } = &entry.rule.params else {
                continue;
            };
            let open_flags: Vec<bool> = {
                let by_id = self.by_id.read();
                rules
                    .iter()
                    .map(|id| {
                        by_id
                            .get(id)
                            .map(|e| e.state.lock().open.is_some())
                            .unwrap_or(false)
                    })
                    .collect()
            };
            let firing = if *require_all {
                !open_flags.is_empty() && open_flags.iter().all(|&b| b)
            } else {
                open_flags.iter().any(|&b| b)
            };
            self.stats.evaluations.fetch_add(1, Ordering::Relaxed);
            let tv = TimestampedValue::new(
                // Compound rules have no single source point; synthesise one
                // from the rule id for the event payload.
                PointRef::VirtualPoint(gridflow_protocol::VirtualPointId::new(
                    entry.rule.id.as_i64(),
                )),
                entry.rule.tenant_id,
                Value::Bool(firing),
                Quality::Good,
            );
            let mut state = entry.state.lock();
            if firing {
                if state.open.is_none() {
                    self.fire(&entry, &mut state, &tv, "compound", None, None, None, overlay, current, pending);
                }
            } else {
                self.recover(&entry, &mut state, &tv, pending);
            }
        }
    }

    /// Auto-acknowledge occurrences whose timeout elapsed. Runs at most once
    /// per second.
    fn auto_acknowledge_tick(&self, pending: &mut Vec<Pending>) {
        let now = Utc::now();
        {
            let mut last = self.last_auto_check.lock();
            if (now - *last).num_milliseconds() < 1_000 {
                return;
            }
            *last = now;
        }
        let entries: Vec<Arc<RuleEntry>> = self.by_id.read().values().cloned().collect();
        for entry in entries {
            if !entry.rule.auto_acknowledge {
                continue;
            }
            let timeout = entry.rule.auto_ack_timeout_secs.unwrap_or(0);
            let mut state = entry.state.lock();
            let Some(open) = state.open.as_mut() else { continue };
            if open.state != AlarmState::Active {
                continue;
            }
            if (now - open.occurred_at).num_seconds() < timeout as i64 {
                continue;
            }
            open.state = AlarmState::Acknowledged;
            open.acknowledged_at = Some(now);
            open.acknowledged_by = Some("system:auto".into());
            let occurrence = open.clone();
            self.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
            pending.push(Pending::Update {
                entry: Arc::clone(&entry),
                occurrence,
                fields: OccurrenceUpdate::acknowledge("system:auto", None),
                threshold: None,
                publish: true,
            });
        }
    }

    // ------------------------------------------------------------------
    // Transitions (under the rule state mutex)
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn fire(
        &self,
        entry: &Arc<RuleEntry>,
        state: &mut RuleState,
        tv: &TimestampedValue,
        condition: &str,
        threshold: Option<f64>,
        message_override: Option<String>,
        severity_override: Option<Severity>,
        overlay: &HashMap<PointRef, Value>,
        current: &CurrentValueStore,
        pending: &mut Vec<Pending>,
    ) {
        let now = Utc::now();

        // Escalation: repeated fires in the window raise severity one step.
        state.recent_fires.push_back(now);
        let window_start = now - ChronoDuration::minutes(ESCALATION_WINDOW_MINS);
        while state.recent_fires.front().is_some_and(|t| *t < window_start) {
            state.recent_fires.pop_front();
        }
        let mut severity = severity_override.unwrap_or(entry.rule.severity);
        if state.recent_fires.len() >= ESCALATION_FIRE_COUNT {
            severity = severity.escalated();
        }

        let suppressed = self.is_suppressed(entry, tv.tenant_id, now, overlay, current);
        let message = message_override.unwrap_or_else(|| {
            self.render_message(entry, tv, condition, threshold)
        });

        let occurrence = AlarmOccurrence {
            id: OccurrenceId::new(0),
            rule_id: entry.rule.id,
            tenant_id: entry.rule.tenant_id,
            occurred_at: now,
            trigger_value: tv.value.clone(),
            condition: condition.to_string(),
            message,
            severity,
            state: if suppressed { AlarmState::Suppressed } else { AlarmState::Active },
            acknowledged_at: None,
            acknowledged_by: None,
            ack_comment: None,
            cleared_at: None,
            cleared_value: None,
            clear_comment: None,
            context: serde_json::json!({
                "point": tv.point,
                "quality": tv.quality.tag(),
                "source_timestamp": tv.source_timestamp.to_rfc3339(),
            }),
        };

        state.condition_recovered = false;
        state.open = Some(occurrence.clone());
        self.stats.triggered.fetch_add(1, Ordering::Relaxed);
        self.stats.count_severity(severity);
        if suppressed {
            self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
        }

        pending.push(Pending::Create {
            entry: Arc::clone(entry),
            occurrence,
            threshold,
            // Suppressed occurrences are recorded but not announced.
            publish: !suppressed,
        });
    }

    /// A suppressed occurrence whose suppression has lifted (and whose
    /// condition still fires) returns to `active` and is announced.
    fn reactivate_if_unsuppressed(
        &self,
        entry: &Arc<RuleEntry>,
        state: &mut RuleState,
        tenant: TenantId,
        overlay: &HashMap<PointRef, Value>,
        current: &CurrentValueStore,
        pending: &mut Vec<Pending>,
    ) {
        let now = Utc::now();
        let Some(open) = state.open.as_mut() else { return };
        if open.state != AlarmState::Suppressed {
            return;
        }
        if self.is_suppressed(entry, tenant, now, overlay, current) {
            return;
        }
        open.state = AlarmState::Active;
        let occurrence = open.clone();
        pending.push(Pending::Update {
            entry: Arc::clone(entry),
            occurrence,
            fields: OccurrenceUpdate::default(),
            threshold: None,
            publish: true,
        });
    }

    /// Handle the underlying condition going back to normal.
    fn recover(
        &self,
        entry: &Arc<RuleEntry>,
        state: &mut RuleState,
        tv: &TimestampedValue,
        pending: &mut Vec<Pending>,
    ) {
        let Some(open) = state.open.as_ref() else { return };
        if entry.rule.latched || !entry.rule.auto_clear {
            // Stays open awaiting the operator; remember the recovery.
            state.condition_recovered = true;
            return;
        }
        if !open.state.can_transition_to(AlarmState::Cleared) {
            return;
        }
        let mut occurrence = state.open.take().unwrap_or_else(|| unreachable!());
        occurrence.state = AlarmState::Cleared;
        occurrence.cleared_at = Some(Utc::now());
        occurrence.cleared_value = Some(tv.value.clone());
        state.condition_recovered = false;
        state.level = AlarmLevel::Normal;
        self.stats.cleared.fetch_add(1, Ordering::Relaxed);
        if occurrence.id.as_i64() != 0 {
            self.open_index.remove(&occurrence.id);
        }
        let fields = OccurrenceUpdate::clear(Some(tv.value.clone()), None);
        pending.push(Pending::Update {
            entry: Arc::clone(entry),
            occurrence,
            fields,
            threshold: None,
            publish: true,
        });
    }

    fn is_suppressed(
        &self,
        entry: &RuleEntry,
        tenant: TenantId,
        now: DateTime<Utc>,
        overlay: &HashMap<PointRef, Value>,
        current: &CurrentValueStore,
    ) -> bool {
        if entry.temp_suppress_until.lock().is_some_and(|until| now < until) {
            return true;
        }
        let Some(policy) = entry.suppression.as_ref() else { return false };
        if policy.window_active(now) {
            return true;
        }
        if let Some(other) = policy.while_rule_active {
            let open = self
                .by_id
                .read()
                .get(&other)
                .map(|e| e.state.lock().open.is_some())
                .unwrap_or(false);
            if open {
                return true;
            }
        }
        if let Some(gate) = &policy.while_gate_point {
            let point = self.name_index.read().get(&(tenant, gate.clone())).copied();
            if let Some(point) = point {
                let value =
                    overlay.get(&point).cloned().or_else(|| current.value(tenant, point));
                if value.is_some_and(|v| v.as_bool()) {
                    return true;
                }
            }
        }
        false
    }

    fn render_message(
        &self,
        entry: &RuleEntry,
        tv: &TimestampedValue,
        condition: &str,
        threshold: Option<f64>,
    ) -> String {
        let point_name = self
            .meta
            .read()
            .get(&tv.point)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| tv.point.to_string());
        let template = entry
            .rule
            .message_template
            .clone()
            .unwrap_or_else(|| "{point} {condition}: {value}".to_string());
        template
            .replace("{point}", &point_name)
            .replace("{value}", &tv.value.to_string())
            .replace("{threshold}", &threshold.map(|t| t.to_string()).unwrap_or_default())
            .replace("{condition}", condition)
    }

    // ------------------------------------------------------------------
    // Persistence + event building
    // ------------------------------------------------------------------

    async fn commit(&self, pending: Pending) -> Option<AlarmEvent> {
        match pending {
            Pending::Create { entry, mut occurrence, threshold, publish } => {
                match self.persist_new(&occurrence).await {
                    Some(id) => {
                        occurrence.id = id;
                        *entry.last_persisted_id.lock() = Some(id);
                        self.open_index.insert(id, occurrence.rule_id);
                        // Patch the id into the live state block if this
                        // occurrence is still the open one.
                        let mut state = entry.state.lock();
                        if let Some(open) = state.open.as_mut() {
                            if open.id.as_i64() == 0 && open.occurred_at == occurrence.occurred_at {
                                open.id = id;
                            }
                        }
                    }
                    None => {
                        METRICS.persist_failures.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "Failed to persist occurrence for rule {}; publishing anyway",
                            occurrence.rule_id
                        );
                    }
                }
                publish.then(|| self.build_event(&entry, &occurrence, threshold))
            }
            Pending::Update { entry, mut occurrence, fields, threshold, publish } => {
                if occurrence.id.as_i64() == 0 {
                    // The create for this occurrence committed earlier in the
                    // same batch (pulse rules); pick up its assigned id.
                    if let Some(id) = *entry.last_persisted_id.lock() {
                        occurrence.id = id;
                    }
                }
                if occurrence.id.as_i64() != 0 {
                    let mut attempt = 0;
                    loop {
                        match self
                            .store
                            .update_occurrence_state(occurrence.id, occurrence.state, fields.clone())
                            .await
                        {
                            Ok(()) => break,
                            Err(e) => {
                                attempt += 1;
                                if attempt >= PERSIST_RETRY_ATTEMPTS {
                                    METRICS.persist_failures.fetch_add(1, Ordering::Relaxed);
                                    error!("Failed to update occurrence {}: {e}", occurrence.id);
                                    break;
                                }
                                tokio::time::sleep(Duration::from_millis(PERSIST_RETRY_DELAY_MS))
                                    .await;
                            }
                        }
                    }
                    if occurrence.state == AlarmState::Cleared {
                        self.open_index.remove(&occurrence.id);
                    }
                }
                publish.then(|| self.build_event(&entry, &occurrence, threshold))
            }
        }
    }

    async fn persist_new(&self, occurrence: &AlarmOccurrence) -> Option<OccurrenceId> {
        for attempt in 1..=PERSIST_RETRY_ATTEMPTS {
            match self.store.persist_occurrence(occurrence).await {
                Ok(id) => return Some(id),
                Err(e) => {
                    warn!(
                        "persist occurrence (rule {}) attempt {attempt}/{PERSIST_RETRY_ATTEMPTS}: {e}",
                        occurrence.rule_id
                    );
                    if attempt < PERSIST_RETRY_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(PERSIST_RETRY_DELAY_MS)).await;
                    }
                }
            }
        }
        None
    }

    fn build_event(
        &self,
        entry: &RuleEntry,
        occurrence: &AlarmOccurrence,
        threshold: Option<f64>,
    ) -> AlarmEvent {
        let (point_id, device_id, source_name, location) = match &entry.rule.target {
            AlarmTarget::DataPoint(id) => {
                let point = PointRef::DataPoint(*id);
                let meta = self.meta.read();
                let m = meta.get(&point);
                (
                    Some(point),
                    m.and_then(|m| m.device_id),
                    m.map(|m| m.name.clone()),
                    m.and_then(|m| m.location.clone()),
                )
            }
            AlarmTarget::VirtualPoint(id) => {
                let point = PointRef::VirtualPoint(*id);
                let meta = self.meta.read();
                let m = meta.get(&point);
                (
                    Some(point),
                    m.and_then(|m| m.device_id),
                    m.map(|m| m.name.clone()),
                    m.and_then(|m| m.location.clone()),
                )
            }
            AlarmTarget::Device(id) => (None, Some(*id), Some(entry.rule.name.clone()), None),
            AlarmTarget::Group(name) => (None, None, Some(name.clone()), None),
        };
        AlarmEvent::from_occurrence(
            occurrence,
            entry.rule.params.type_name(),
            device_id,
            point_id,
            threshold,
            source_name,
            location,
        )
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    /// Acknowledge an occurrence. Latched rules whose condition already
    /// recovered are cleared by the acknowledgement.
    pub async fn acknowledge(
        &self,
        occurrence_id: OccurrenceId,
        user: &str,
        comment: Option<String>,
    ) -> Result<Vec<AlarmEvent>> {
        let entry = self.entry_for_occurrence(occurrence_id)?;
        let mut pending = Vec::new();
        {
            let mut state = entry.state.lock();
            let open = state
                .open
                .as_mut()
                .filter(|o| o.id == occurrence_id)
                .ok_or(EngineError::OccurrenceNotFound(occurrence_id.as_i64()))?;
            if !open.state.can_transition_to(AlarmState::Acknowledged) {
                return Err(EngineError::InvalidTransition(format!(
                    "{} -> acknowledged",
                    open.state
                )));
            }
            let now = Utc::now();
            open.state = AlarmState::Acknowledged;
            open.acknowledged_at = Some(now);
            open.acknowledged_by = Some(user.to_string());
            open.ack_comment = comment.clone();
            let occurrence = open.clone();
            self.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
            pending.push(Pending::Update {
                entry: Arc::clone(&entry),
                occurrence,
                fields: OccurrenceUpdate::acknowledge(user, comment),
                threshold: None,
                publish: true,
            });

            // Latched + recovered: the acknowledgement releases the latch.
            if entry.rule.latched && state.condition_recovered {
                let mut occurrence = state.open.take().unwrap_or_else(|| unreachable!());
                occurrence.state = AlarmState::Cleared;
                occurrence.cleared_at = Some(Utc::now());
                state.condition_recovered = false;
                state.level = AlarmLevel::Normal;
                self.stats.cleared.fetch_add(1, Ordering::Relaxed);
                self.open_index.remove(&occurrence_id);
                pending.push(Pending::Update {
                    entry: Arc::clone(&entry),
                    occurrence,
                    fields: OccurrenceUpdate::clear(None, Some("latched alarm released".into())),
                    threshold: None,
                    publish: true,
                });
            }
        }
        let mut events = Vec::new();
        for p in pending {
            if let Some(event) = self.commit(p).await {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Operator clear.
    pub async fn clear_occurrence(
        &self,
        occurrence_id: OccurrenceId,
        value: Option<Value>,
        comment: Option<String>,
    ) -> Result<AlarmEvent> {
        let entry = self.entry_for_occurrence(occurrence_id)?;
        let pending = {
            let mut state = entry.state.lock();
            let open = state
                .open
                .as_ref()
                .filter(|o| o.id == occurrence_id)
                .ok_or(EngineError::OccurrenceNotFound(occurrence_id.as_i64()))?;
            if !open.state.can_transition_to(AlarmState::Cleared) {
                return Err(EngineError::InvalidTransition(format!("{} -> cleared", open.state)));
            }
            let mut occurrence = state.open.take().unwrap_or_else(|| unreachable!());
            occurrence.state = AlarmState::Cleared;
            occurrence.cleared_at = Some(Utc::now());
            occurrence.cleared_value = value.clone();
            occurrence.clear_comment = comment.clone();
            state.condition_recovered = false;
            state.level = AlarmLevel::Normal;
            self.stats.cleared.fetch_add(1, Ordering::Relaxed);
            self.open_index.remove(&occurrence_id);
            Pending::Update {
                entry: Arc::clone(&entry),
                occurrence,
                fields: OccurrenceUpdate::clear(value, comment),
                threshold: None,
                publish: true,
            }
        };
        self.commit(pending)
            .await
            .ok_or_else(|| EngineError::OccurrenceNotFound(occurrence_id.as_i64()))
    }

    /// Shelve an open occurrence (operator-initiated quiet period).
    pub async fn shelve_occurrence(&self, occurrence_id: OccurrenceId) -> Result<AlarmEvent> {
        let entry = self.entry_for_occurrence(occurrence_id)?;
        let pending = {
            let mut state = entry.state.lock();
            let open = state
                .open
                .as_mut()
                .filter(|o| o.id == occurrence_id)
                .ok_or(EngineError::OccurrenceNotFound(occurrence_id.as_i64()))?;
            if !open.state.can_transition_to(AlarmState::Shelved) {
                return Err(EngineError::InvalidTransition(format!("{} -> shelved", open.state)));
            }
            open.state = AlarmState::Shelved;
            let occurrence = open.clone();
            Pending::Update {
                entry: Arc::clone(&entry),
                occurrence,
                fields: OccurrenceUpdate::default(),
                threshold: None,
                publish: true,
            }
        };
        self.commit(pending)
            .await
            .ok_or_else(|| EngineError::OccurrenceNotFound(occurrence_id.as_i64()))
    }

    /// Suppress a rule for a duration. An open active occurrence moves to
    /// `suppressed` (recorded, not announced).
    pub async fn suppress_rule(&self, rule_id: RuleId, duration: Duration) -> Result<()> {
        let entry = self
            .by_id
            .read()
            .get(&rule_id)
            .cloned()
            .ok_or(EngineError::RuleNotFound(rule_id))?;
        let until = Utc::now() + ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::zero());
        *entry.temp_suppress_until.lock() = Some(until);

        let pending = {
            let mut state = entry.state.lock();
            match state.open.as_mut() {
                Some(open) if open.state == AlarmState::Active => {
                    open.state = AlarmState::Suppressed;
                    self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
                    Some(Pending::Update {
                        entry: Arc::clone(&entry),
                        occurrence: open.clone(),
                        fields: OccurrenceUpdate::default(),
                        threshold: None,
                        publish: false,
                    })
                }
                _ => None,
            }
        };
        if let Some(p) = pending {
            self.commit(p).await;
        }
        Ok(())
    }

    fn entry_for_occurrence(&self, occurrence_id: OccurrenceId) -> Result<Arc<RuleEntry>> {
        let rule_id = self
            .open_index
            .get(&occurrence_id)
            .map(|r| *r)
            .ok_or(EngineError::OccurrenceNotFound(occurrence_id.as_i64()))?;
        self.by_id
            .read()
            .get(&rule_id)
            .cloned()
            .ok_or(EngineError::RuleNotFound(rule_id))
    }
}
