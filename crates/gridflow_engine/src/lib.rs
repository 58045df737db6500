//! Processing plane for gridflow.
//!
//! The chain the workers feed: pipeline queue -> processing pool ->
//! (virtual-point engine, alarm engine) -> current values, time series,
//! pub/sub. Plus alarm startup recovery and the control surface types.

pub mod alarm;
pub mod control;
pub mod current;
pub mod error;
pub mod metrics;
pub mod processing;
pub mod queue;
pub mod recovery;
pub mod vp;

pub use alarm::{AlarmEngine, PointMeta};
pub use control::{ControlRequest, ControlResponse, WorkerStatusInfo};
pub use current::{CurrentValue, CurrentValueStore};
pub use error::{EngineError, Result};
pub use metrics::{MetricsSnapshot, METRICS};
pub use processing::{ProcessingConfig, ProcessingService};
pub use queue::{PipelineQueue, QueueStats};
pub use recovery::{RecoveryConfig, RecoveryStats, StartupRecovery};
pub use vp::VirtualPointEngine;
