//! Control surface message types.
//!
//! JSON request/response envelopes used by the operator-facing layer (the
//! REST surface is an external collaborator; it speaks these shapes). The
//! dispatcher lives in the binary, which owns both the worker manager and
//! the engines.

use crate::alarm::stats::AlarmStatsSnapshot;
use crate::metrics::MetricsSnapshot;
use crate::queue::QueueStats;
use gridflow_protocol::{
    AlarmEvent, DeviceId, OccurrenceId, PointId, RuleId, TenantId, Value,
};
use serde::{Deserialize, Serialize};

/// Control API request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlRequest {
    // Worker manager
    StartWorker { device_id: DeviceId },
    StopWorker { device_id: DeviceId },
    PauseWorker { device_id: DeviceId },
    ResumeWorker { device_id: DeviceId },
    RestartWorker { device_id: DeviceId },
    WorkerStatus { device_id: DeviceId },
    ListWorkers,
    StartAllActive,
    StopAll,
    WritePoint { device_id: DeviceId, point_id: PointId, value: Value },
    ControlDigital { device_id: DeviceId, output_id: PointId, on: bool },
    ControlAnalog { device_id: DeviceId, output_id: PointId, value: f64 },

    // Alarms
    Acknowledge { occurrence_id: OccurrenceId, user: String, comment: Option<String> },
    ClearAlarm { occurrence_id: OccurrenceId, value: Option<Value>, comment: Option<String> },
    SuppressRule { rule_id: RuleId, duration_secs: u64 },
    ShelveOccurrence { occurrence_id: OccurrenceId },
    ReloadRules { tenant_id: TenantId },

    // Introspection
    QueueStats,
    EngineStats,
    AlarmStats,
    RecoveryProgress,
    Ping,
}

/// One worker's externally visible status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerStatusInfo {
    pub device_id: DeviceId,
    pub protocol: String,
    pub state: String,
    pub connected: bool,
    pub reads: u64,
    pub writes: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

/// Control API response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlResponse {
    Ok,
    /// Result of an alarm operation; carries the published events.
    AlarmEvents(Vec<AlarmEvent>),
    Worker(Option<WorkerStatusInfo>),
    Workers(Vec<WorkerStatusInfo>),
    QueueStats(QueueStats),
    EngineStats(MetricsSnapshot),
    AlarmStats(AlarmStatsSnapshot),
    RecoveryProgress { current: usize, total: usize },
    Pong,
    Error { code: String, message: String },
}

impl ControlResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error { code: code.into(), message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_shape() {
        let req = ControlRequest::Acknowledge {
            occurrence_id: OccurrenceId::new(9),
            user: "op".into(),
            comment: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "Acknowledge");
        assert_eq!(json["payload"]["occurrence_id"], 9);
        let back: ControlRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(back, ControlRequest::Acknowledge { .. }));
    }

    #[test]
    fn error_response_helper() {
        let resp = ControlResponse::error("not_found", "no such worker");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("not_found"));
    }
}
