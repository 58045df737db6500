//! Current-value store.
//!
//! The in-memory view of every point's latest value, shared between the
//! processing stages, the virtual-point engine (input fallback) and the
//! alarm engine (gate points). Writers are the processing threads; the map
//! is sharded (`DashMap`), so updates for distinct points never contend.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gridflow_protocol::{ChangeFlags, PointRef, Quality, TenantId, TimestampedValue, Value};
use serde::{Deserialize, Serialize};

/// Latest known state of one point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentValue {
    pub value: Value,
    pub quality: Quality,
    pub value_ts: DateTime<Utc>,
    pub quality_ts: DateTime<Utc>,
    pub read_count: u64,
    pub write_count: u64,
    pub error_count: u64,
}

#[derive(Default)]
pub struct CurrentValueStore {
    values: DashMap<(TenantId, PointRef), CurrentValue>,
}

impl CurrentValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant: TenantId, point: PointRef) -> Option<CurrentValue> {
        self.values.get(&(tenant, point)).map(|v| v.clone())
    }

    pub fn value(&self, tenant: TenantId, point: PointRef) -> Option<Value> {
        self.values.get(&(tenant, point)).map(|v| v.value.clone())
    }

    /// Apply one reading, returning the change flags relative to the prior
    /// state (INITIAL on first sight).
    pub fn apply(&self, tv: &TimestampedValue) -> ChangeFlags {
        let key = (tv.tenant_id, tv.point);
        let mut flags = ChangeFlags::empty();
        match self.values.get_mut(&key) {
            Some(mut entry) => {
                if entry.value != tv.value {
                    flags = flags.with(ChangeFlags::VALUE_CHANGED);
                    entry.value = tv.value.clone();
                    entry.value_ts = tv.source_timestamp;
                }
                if entry.quality != tv.quality {
                    flags = flags.with(ChangeFlags::QUALITY_CHANGED);
                    entry.quality = tv.quality;
                    entry.quality_ts = tv.source_timestamp;
                }
                entry.read_count += 1;
                if tv.quality.is_bad() {
                    entry.error_count += 1;
                }
            }
            None => {
                flags = ChangeFlags::INITIAL
                    .with(ChangeFlags::VALUE_CHANGED)
                    .with(ChangeFlags::QUALITY_CHANGED);
                self.values.insert(
                    key,
                    CurrentValue {
                        value: tv.value.clone(),
                        quality: tv.quality,
                        value_ts: tv.source_timestamp,
                        quality_ts: tv.source_timestamp,
                        read_count: 1,
                        write_count: 0,
                        error_count: u64::from(tv.quality.is_bad()),
                    },
                );
            }
        }
        flags
    }

    /// Count a scalar write issued to the device for this point.
    pub fn record_write(&self, tenant: TenantId, point: PointRef) {
        if let Some(mut entry) = self.values.get_mut(&(tenant, point)) {
            entry.write_count += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
