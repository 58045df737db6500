//! Published event wire formats.
//!
//! Everything that leaves the process over pub/sub is one of these JSON
//! shapes. Timestamps serialise as ISO-8601 UTC (chrono RFC3339).

use crate::ids::{DeviceId, OccurrenceId, PointRef, RuleId, TenantId};
use crate::model::{AlarmOccurrence, AlarmState, Severity};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pub/sub channel names.
pub mod channels {
    pub const VALUE_CHANGED: &str = "value_changed";
    pub const ALARM_EVENT: &str = "alarm_event";
    pub const ALARM_CLEARED: &str = "alarm_cleared";
}

/// Emitted on every value change that survives processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChangedEvent {
    pub point_id: PointRef,
    pub tenant_id: TenantId,
    pub value: Value,
    /// Quality wire tag, e.g. "good" or "bad/comm_failure".
    pub quality: String,
    pub ts_source: DateTime<Utc>,
    pub ts_received: DateTime<Utc>,
}

/// Emitted on every alarm state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub occurrence_id: OccurrenceId,
    pub rule_id: RuleId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub point_id: Option<PointRef>,
    pub severity: Severity,
    pub state: AlarmState,
    /// Rule type tag: analog | digital | script | communication | quality | compound.
    pub alarm_type: String,
    pub message: String,
    pub trigger_value: Value,
    #[serde(default)]
    pub threshold_value: Option<f64>,
    /// Condition tag that fired, e.g. "high", "on_rising".
    pub trigger_condition: String,
    pub occurrence_time: DateTime<Utc>,
    #[serde(default)]
    pub cleared_value: Option<Value>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl AlarmEvent {
    /// Build the wire event for an occurrence's current state.
    pub fn from_occurrence(
        occ: &AlarmOccurrence,
        alarm_type: &str,
        device_id: Option<DeviceId>,
        point_id: Option<PointRef>,
        threshold_value: Option<f64>,
        source_name: Option<String>,
        location: Option<String>,
    ) -> Self {
        Self {
            occurrence_id: occ.id,
            rule_id: occ.rule_id,
            tenant_id: occ.tenant_id,
            device_id,
            point_id,
            severity: occ.severity,
            state: occ.state,
            alarm_type: alarm_type.to_string(),
            message: occ.message.clone(),
            trigger_value: occ.trigger_value.clone(),
            threshold_value,
            trigger_condition: occ.condition.clone(),
            occurrence_time: occ.occurred_at,
            cleared_value: occ.cleared_value.clone(),
            source_name,
            location,
        }
    }

    /// Channel this event publishes on.
    pub fn channel(&self) -> &'static str {
        match self.state {
            AlarmState::Cleared => channels::ALARM_CLEARED,
            _ => channels::ALARM_EVENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PointId;

    #[test]
    fn alarm_event_json_roundtrip() {
        let event = AlarmEvent {
            occurrence_id: OccurrenceId::new(9),
            rule_id: RuleId::new(3),
            tenant_id: TenantId::new(1),
            device_id: Some(DeviceId::new(4)),
            point_id: Some(PointRef::DataPoint(PointId::new(100))),
            severity: Severity::High,
            state: AlarmState::Active,
            alarm_type: "analog".into(),
            message: "Temperature high: 85".into(),
            trigger_value: Value::Float(85.0),
            threshold_value: Some(80.0),
            trigger_condition: "high".into(),
            occurrence_time: Utc::now(),
            cleared_value: None,
            source_name: Some("boiler-1/temp".into()),
            location: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: AlarmEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(event.channel(), channels::ALARM_EVENT);
    }

    #[test]
    fn cleared_events_use_the_cleared_channel() {
        let mut event = AlarmEvent {
            occurrence_id: OccurrenceId::new(1),
            rule_id: RuleId::new(1),
            tenant_id: TenantId::new(1),
            device_id: None,
            point_id: None,
            severity: Severity::Info,
            state: AlarmState::Cleared,
            alarm_type: "digital".into(),
            message: String::new(),
            trigger_value: Value::Bool(true),
            threshold_value: None,
            trigger_condition: "on_rising".into(),
            occurrence_time: Utc::now(),
            cleared_value: Some(Value::Bool(false)),
            source_name: None,
            location: None,
        };
        assert_eq!(event.channel(), channels::ALARM_CLEARED);
        event.state = AlarmState::Acknowledged;
        assert_eq!(event.channel(), channels::ALARM_EVENT);
    }

    #[test]
    fn timestamps_serialise_as_iso8601_utc() {
        let event = ValueChangedEvent {
            point_id: PointRef::DataPoint(PointId::new(1)),
            tenant_id: TenantId::new(1),
            value: Value::Int(3),
            quality: "good".into(),
            ts_source: "2026-03-01T12:00:00Z".parse().unwrap(),
            ts_received: "2026-03-01T12:00:00.250Z".parse().unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        let ts = json["ts_source"].as_str().unwrap();
        assert!(ts.starts_with("2026-03-01T12:00:00"));
        assert!(ts.ends_with('Z') || ts.contains("+00:00"));
    }
}
