//! Pipeline message types.
//!
//! `TimestampedValue` is the unit that flows from workers to the processing
//! service; `DeviceDataMessage` is the batch envelope one worker emission
//! produces. Both are plain data and cheap to clone.

use crate::ids::{DeviceId, PointRef, TenantId};
use crate::value::{Quality, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field protocol a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    ModbusTcp,
    ModbusRtu,
    Bacnet,
    Mqtt,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::ModbusTcp => "modbus_tcp",
            Protocol::ModbusRtu => "modbus_rtu",
            Protocol::Bacnet => "bacnet",
            Protocol::Mqtt => "mqtt",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Advisory priority on a batch envelope. FIFO order is preserved regardless;
/// priority is recorded for statistics and future reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

// Minimal local bitflags; the flag set is tiny and stable.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $($(#[$fmeta:meta])* const $flag:ident = $val:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
        #[serde(transparent)]
        pub struct $name($ty);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($val);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> $ty {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[must_use]
            pub const fn with(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }
    };
}

bitflags_lite! {
    /// Change markers stamped by the producer.
    pub struct ChangeFlags: u8 {
        /// The value differs from the previous reading.
        const VALUE_CHANGED = 0b0001;
        /// The quality differs from the previous reading.
        const QUALITY_CHANGED = 0b0010;
        /// First reading after (re)connect.
        const INITIAL = 0b0100;
    }
}

/// One normalised reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub point: PointRef,
    pub tenant_id: TenantId,
    pub value: Value,
    pub quality: Quality,
    /// When the device says the value was sampled.
    pub source_timestamp: DateTime<Utc>,
    /// When this process first saw the value.
    pub received_timestamp: DateTime<Utc>,
    pub change_flags: ChangeFlags,
}

impl TimestampedValue {
    pub fn new(point: PointRef, tenant_id: TenantId, value: Value, quality: Quality) -> Self {
        let now = Utc::now();
        Self {
            point,
            tenant_id,
            value,
            quality,
            source_timestamp: now,
            received_timestamp: now,
            change_flags: ChangeFlags::empty(),
        }
    }

    pub fn with_source_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.source_timestamp = ts;
        self
    }

    pub fn with_flags(mut self, flags: ChangeFlags) -> Self {
        self.change_flags = flags;
        self
    }
}

/// Batch envelope: everything one worker emission produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDataMessage {
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub protocol: Protocol,
    pub priority: Priority,
    pub values: Vec<TimestampedValue>,
    /// Stable identifier of the producing worker instance.
    pub producer_id: String,
    pub envelope_timestamp: DateTime<Utc>,
}

impl DeviceDataMessage {
    pub fn new(
        device_id: DeviceId,
        tenant_id: TenantId,
        protocol: Protocol,
        values: Vec<TimestampedValue>,
        producer_id: impl Into<String>,
    ) -> Self {
        Self {
            device_id,
            tenant_id,
            protocol,
            priority: Priority::Normal,
            values,
            producer_id: producer_id.into(),
            envelope_timestamp: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PointId;

    #[test]
    fn change_flags_compose() {
        let flags = ChangeFlags::VALUE_CHANGED.with(ChangeFlags::INITIAL);
        assert!(flags.contains(ChangeFlags::VALUE_CHANGED));
        assert!(flags.contains(ChangeFlags::INITIAL));
        assert!(!flags.contains(ChangeFlags::QUALITY_CHANGED));
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let tv = TimestampedValue::new(
            PointRef::DataPoint(PointId::new(100)),
            TenantId::new(1),
            Value::Float(21.5),
            Quality::Good,
        );
        let msg = DeviceDataMessage::new(
            DeviceId::new(7),
            TenantId::new(1),
            Protocol::ModbusTcp,
            vec![tv],
            "modbus-7",
        )
        .with_priority(Priority::High);

        let json = serde_json::to_string(&msg).unwrap();
        let back: DeviceDataMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
