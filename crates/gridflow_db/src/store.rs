//! Store contract.
//!
//! The engine and workers talk to the relational store through this trait;
//! the SQLite implementation lives in [`crate::sqlite`], the test harness
//! provides an in-memory one.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridflow_protocol::{
    AlarmOccurrence, AlarmRule, AlarmState, DataPoint, Device, DeviceId, OccurrenceId, Severity,
    TenantId, Value, VirtualPoint,
};

/// Mutable occurrence fields for a state update. Only the fields relevant to
/// the transition are set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OccurrenceUpdate {
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub ack_comment: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub cleared_value: Option<Value>,
    pub clear_comment: Option<String>,
}

impl OccurrenceUpdate {
    pub fn acknowledge(user: impl Into<String>, comment: Option<String>) -> Self {
        Self {
            acknowledged_at: Some(Utc::now()),
            acknowledged_by: Some(user.into()),
            ack_comment: comment,
            ..Default::default()
        }
    }

    pub fn clear(value: Option<Value>, comment: Option<String>) -> Self {
        Self {
            cleared_at: Some(Utc::now()),
            cleared_value: value,
            clear_comment: comment,
            ..Default::default()
        }
    }
}

/// Filter for active-occurrence loads (startup recovery and views).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OccurrenceFilter {
    pub tenant: Option<TenantId>,
    /// Keep only occurrences at least this severe.
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Contract on the relational store.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Enabled devices, optionally narrowed to a tenant.
    async fn list_active_devices(&self, tenant: Option<TenantId>) -> Result<Vec<Device>>;

    async fn load_device(&self, id: DeviceId) -> Result<Device>;

    async fn load_datapoints(&self, device_id: DeviceId) -> Result<Vec<DataPoint>>;

    async fn load_rules(&self, tenant: TenantId) -> Result<Vec<AlarmRule>>;

    async fn load_virtualpoints(&self, tenant: TenantId) -> Result<Vec<VirtualPoint>>;

    /// Insert a new occurrence, returning its assigned id.
    async fn persist_occurrence(&self, occurrence: &AlarmOccurrence) -> Result<OccurrenceId>;

    async fn update_occurrence_state(
        &self,
        id: OccurrenceId,
        state: AlarmState,
        fields: OccurrenceUpdate,
    ) -> Result<()>;

    /// Occurrences with `state = active` and no acknowledgement, filtered.
    async fn load_active_occurrences(
        &self,
        filter: &OccurrenceFilter,
    ) -> Result<Vec<AlarmOccurrence>>;

    /// Every non-terminal occurrence (state not cleared/inactive), filtered.
    /// Startup recovery loads these and validates each one itself.
    async fn load_open_occurrences(
        &self,
        filter: &OccurrenceFilter,
    ) -> Result<Vec<AlarmOccurrence>>;
}
