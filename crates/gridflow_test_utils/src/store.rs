//! In-memory store and sink doubles.

use async_trait::async_trait;
use gridflow_db::{OccurrenceFilter, OccurrenceUpdate, RelationalStore, Result, StoreError};
use gridflow_sinks::{CacheSink, MemoryCacheSink, MessageHandler, SinkError};
use gridflow_protocol::{
    AlarmOccurrence, AlarmRule, AlarmState, DataPoint, Device, DeviceId, OccurrenceId, PointRef,
    TenantId, VirtualPoint,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// `RelationalStore` backed by vectors; mirrors the SQLite semantics the
/// engine relies on, including the one-open-occurrence-per-rule constraint.
#[derive(Default)]
pub struct MemoryStore {
    pub devices: Mutex<Vec<Device>>,
    pub datapoints: Mutex<Vec<DataPoint>>,
    pub rules: Mutex<Vec<AlarmRule>>,
    pub virtualpoints: Mutex<Vec<VirtualPoint>>,
    pub occurrences: Mutex<Vec<AlarmOccurrence>>,
    next_occurrence_id: AtomicUsize,
    /// When set, persist/update calls fail this many times first.
    persist_failures_remaining: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { next_occurrence_id: AtomicUsize::new(1), ..Default::default() }
    }

    pub fn add_device(&self, device: Device) {
        self.devices.lock().push(device);
    }

    pub fn add_datapoint(&self, point: DataPoint) {
        self.datapoints.lock().push(point);
    }

    pub fn add_rule(&self, rule: AlarmRule) {
        self.rules.lock().push(rule);
    }

    pub fn add_virtualpoint(&self, vp: VirtualPoint) {
        self.virtualpoints.lock().push(vp);
    }

    pub fn add_occurrence(&self, mut occ: AlarmOccurrence) -> OccurrenceId {
        let id = OccurrenceId::new(self.next_occurrence_id.fetch_add(1, Ordering::SeqCst) as i64);
        occ.id = id;
        self.occurrences.lock().push(occ);
        id
    }

    /// Make the next `n` persist/update calls fail.
    pub fn fail_next_persists(&self, n: usize) {
        self.persist_failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn occurrence(&self, id: OccurrenceId) -> Option<AlarmOccurrence> {
        self.occurrences.lock().iter().find(|o| o.id == id).cloned()
    }

    pub fn occurrences_for_rule(&self, rule_id: gridflow_protocol::RuleId) -> Vec<AlarmOccurrence> {
        self.occurrences.lock().iter().filter(|o| o.rule_id == rule_id).cloned().collect()
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.persist_failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.persist_failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::invalid_state("injected store failure"));
        }
        Ok(())
    }
}

fn filtered(
    mut occs: Vec<AlarmOccurrence>,
    filter: &OccurrenceFilter,
) -> Vec<AlarmOccurrence> {
    occs.retain(|occ| {
        filter.tenant.map_or(true, |t| occ.tenant_id == t)
            && filter.min_severity.map_or(true, |m| occ.severity <= m)
            && filter.since.map_or(true, |s| occ.occurred_at >= s)
    });
    if let Some(limit) = filter.limit {
        occs.truncate(limit);
    }
    occs
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn list_active_devices(&self, tenant: Option<TenantId>) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|d| d.enabled && tenant.map_or(true, |t| d.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn load_device(&self, id: DeviceId) -> Result<Device> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("device {id}")))
    }

    async fn load_datapoints(&self, device_id: DeviceId) -> Result<Vec<DataPoint>> {
        Ok(self
            .datapoints
            .lock()
            .iter()
            .filter(|p| p.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn load_rules(&self, tenant: TenantId) -> Result<Vec<AlarmRule>> {
        Ok(self.rules.lock().iter().filter(|r| r.tenant_id == tenant).cloned().collect())
    }

    async fn load_virtualpoints(&self, tenant: TenantId) -> Result<Vec<VirtualPoint>> {
        Ok(self
            .virtualpoints
            .lock()
            .iter()
            .filter(|vp| vp.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn persist_occurrence(&self, occurrence: &AlarmOccurrence) -> Result<OccurrenceId> {
        self.maybe_fail()?;
        let mut occurrences = self.occurrences.lock();
        if occurrence.state.is_open()
            && occurrences
                .iter()
                .any(|o| o.rule_id == occurrence.rule_id && o.state.is_open())
        {
            return Err(StoreError::invalid_state(format!(
                "rule {} already has an open occurrence",
                occurrence.rule_id
            )));
        }
        let id = OccurrenceId::new(self.next_occurrence_id.fetch_add(1, Ordering::SeqCst) as i64);
        let mut stored = occurrence.clone();
        stored.id = id;
        occurrences.push(stored);
        Ok(id)
    }

    async fn update_occurrence_state(
        &self,
        id: OccurrenceId,
        state: AlarmState,
        fields: OccurrenceUpdate,
    ) -> Result<()> {
        self.maybe_fail()?;
        let mut occurrences = self.occurrences.lock();
        let occ = occurrences
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| StoreError::not_found(format!("occurrence {id}")))?;
        occ.state = state;
        if fields.acknowledged_at.is_some() {
            occ.acknowledged_at = fields.acknowledged_at;
            occ.acknowledged_by = fields.acknowledged_by;
            occ.ack_comment = fields.ack_comment;
        }
        if fields.cleared_at.is_some() {
            occ.cleared_at = fields.cleared_at;
            occ.cleared_value = fields.cleared_value;
            occ.clear_comment = fields.clear_comment;
        }
        Ok(())
    }

    async fn load_active_occurrences(
        &self,
        filter: &OccurrenceFilter,
    ) -> Result<Vec<AlarmOccurrence>> {
        let occs: Vec<AlarmOccurrence> = self
            .occurrences
            .lock()
            .iter()
            .filter(|o| o.state == AlarmState::Active && o.acknowledged_at.is_none())
            .cloned()
            .collect();
        Ok(filtered(occs, filter))
    }

    async fn load_open_occurrences(
        &self,
        filter: &OccurrenceFilter,
    ) -> Result<Vec<AlarmOccurrence>> {
        let occs: Vec<AlarmOccurrence> =
            self.occurrences.lock().iter().filter(|o| o.state.is_open()).cloned().collect();
        Ok(filtered(occs, filter))
    }
}

/// Cache sink that fails the first `n` publishes, then delegates to an
/// in-memory sink. Exercises bounded-retry paths.
pub struct FlakyCacheSink {
    pub inner: MemoryCacheSink,
    failures_remaining: AtomicUsize,
}

impl FlakyCacheSink {
    pub fn failing(n: usize) -> Self {
        Self { inner: MemoryCacheSink::new(), failures_remaining: AtomicUsize::new(n) }
    }
}

#[async_trait]
impl CacheSink for FlakyCacheSink {
    async fn set_current_value(
        &self,
        tenant: TenantId,
        point: PointRef,
        json: String,
    ) -> gridflow_sinks::Result<()> {
        self.inner.set_current_value(tenant, point, json).await
    }

    async fn publish(&self, channel: &str, payload: String) -> gridflow_sinks::Result<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::Unavailable("injected publish failure".into()));
        }
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> gridflow_sinks::Result<()> {
        self.inner.subscribe(pattern, handler).await
    }
}
