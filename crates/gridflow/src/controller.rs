//! Control-surface dispatcher.
//!
//! Maps `ControlRequest`s onto the worker manager, the alarm engine, and
//! the statistics snapshots. The REST layer (an external collaborator)
//! speaks these envelopes over whatever transport it prefers.

use crate::app::App;
use gridflow_engine::control::{ControlRequest, ControlResponse};
use gridflow_engine::METRICS;
use std::time::Duration;

pub struct Controller<'a> {
    app: &'a App,
}

impl<'a> Controller<'a> {
    pub fn new(app: &'a App) -> Self {
        Self { app }
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::StartWorker { device_id } => {
                result_to_response(self.app.manager.start(device_id).await)
            }
            ControlRequest::StopWorker { device_id } => {
                result_to_response(self.app.manager.stop(device_id).await)
            }
            ControlRequest::PauseWorker { device_id } => {
                result_to_response(self.app.manager.pause(device_id).await)
            }
            ControlRequest::ResumeWorker { device_id } => {
                result_to_response(self.app.manager.resume(device_id).await)
            }
            ControlRequest::RestartWorker { device_id } => {
                result_to_response(self.app.manager.restart(device_id).await)
            }
            ControlRequest::WorkerStatus { device_id } => {
                ControlResponse::Worker(self.app.manager.status(device_id))
            }
            ControlRequest::ListWorkers => ControlResponse::Workers(self.app.manager.list()),
            ControlRequest::StartAllActive => {
                match self.app.manager.start_all_active(None).await {
                    Ok(_) => ControlResponse::Ok,
                    Err(e) => ControlResponse::error("start_all", e.to_string()),
                }
            }
            ControlRequest::StopAll => {
                self.app.manager.stop_all().await;
                ControlResponse::Ok
            }
            ControlRequest::WritePoint { device_id, point_id, value } => {
                result_to_response(self.app.manager.write_point(device_id, point_id, value).await)
            }
            ControlRequest::ControlDigital { device_id, output_id, on } => {
                result_to_response(self.app.manager.control_digital(device_id, output_id, on).await)
            }
            ControlRequest::ControlAnalog { device_id, output_id, value } => {
                result_to_response(
                    self.app.manager.control_analog(device_id, output_id, value).await,
                )
            }

            ControlRequest::Acknowledge { occurrence_id, user, comment } => {
                match self.app.alarms.acknowledge(occurrence_id, &user, comment).await {
                    Ok(events) => {
                        self.publish_events(&events).await;
                        ControlResponse::AlarmEvents(events)
                    }
                    Err(e) => ControlResponse::error("acknowledge", e.to_string()),
                }
            }
            ControlRequest::ClearAlarm { occurrence_id, value, comment } => {
                match self.app.alarms.clear_occurrence(occurrence_id, value, comment).await {
                    Ok(event) => {
                        self.publish_events(std::slice::from_ref(&event)).await;
                        ControlResponse::AlarmEvents(vec![event])
                    }
                    Err(e) => ControlResponse::error("clear", e.to_string()),
                }
            }
            ControlRequest::SuppressRule { rule_id, duration_secs } => {
                match self
                    .app
                    .alarms
                    .suppress_rule(rule_id, Duration::from_secs(duration_secs))
                    .await
                {
                    Ok(()) => ControlResponse::Ok,
                    Err(e) => ControlResponse::error("suppress", e.to_string()),
                }
            }
            ControlRequest::ShelveOccurrence { occurrence_id } => {
                match self.app.alarms.shelve_occurrence(occurrence_id).await {
                    Ok(event) => {
                        self.publish_events(std::slice::from_ref(&event)).await;
                        ControlResponse::AlarmEvents(vec![event])
                    }
                    Err(e) => ControlResponse::error("shelve", e.to_string()),
                }
            }
            ControlRequest::ReloadRules { tenant_id } => {
                match self.app.alarms.load_tenant(tenant_id).await {
                    Ok(_) => ControlResponse::Ok,
                    Err(e) => ControlResponse::error("reload", e.to_string()),
                }
            }

            ControlRequest::QueueStats => ControlResponse::QueueStats(self.app.queue.stats()),
            ControlRequest::EngineStats => ControlResponse::EngineStats(METRICS.snapshot()),
            ControlRequest::AlarmStats => ControlResponse::AlarmStats(self.app.alarms.stats()),
            ControlRequest::RecoveryProgress => {
                let (current, total) = self.app.recovery.progress();
                ControlResponse::RecoveryProgress { current, total }
            }
            ControlRequest::Ping => ControlResponse::Pong,
        }
    }

    /// Operator-initiated transitions publish exactly like engine ones.
    async fn publish_events(&self, events: &[gridflow_protocol::AlarmEvent]) {
        for event in events {
            if let Ok(payload) = serde_json::to_string(event) {
                if let Err(e) = self.app.cache.publish(event.channel(), payload).await {
                    tracing::warn!("control-surface publish failed: {e}");
                }
            }
        }
    }
}

fn result_to_response(result: gridflow_worker::Result<()>) -> ControlResponse {
    match result {
        Ok(()) => ControlResponse::Ok,
        Err(e) => ControlResponse::error("worker", e.to_string()),
    }
}
