//! Worker base layer.
//!
//! Owns the lifecycle every protocol worker shares: the state machine,
//! reconnect with exponential backoff and jitter, the keep-alive timer, and
//! the command channel. Protocol behaviour plugs in through
//! [`ProtocolWorker`]; the runner drives it and never lets a protocol error
//! escape past the reconnect path.

use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridflow_engine::queue::PipelineQueue;
use gridflow_protocol::defaults::{
    BACKOFF_INITIAL_MS, BACKOFF_JITTER, BACKOFF_MAX_MS, BACKOFF_MULTIPLIER, KEEPALIVE_INTERVAL_MS,
};
use gridflow_protocol::{DeviceId, PointId, Protocol, TenantId, Value};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Starting,
    Connecting,
    Connected,
    Running,
    Paused,
    Reconnecting,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, WorkerState::Connected | WorkerState::Running | WorkerState::Paused)
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Starting => "starting",
            WorkerState::Connecting => "connecting",
            WorkerState::Connected => "connected",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Reconnecting => "reconnecting",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Exponential backoff with jitter. Attempts reset on a successful connect.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Fractional jitter applied as `delay * (1 +/- jitter)`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(BACKOFF_INITIAL_MS),
            multiplier: BACKOFF_MULTIPLIER,
            max: Duration::from_millis(BACKOFF_MAX_MS),
            jitter: BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempts: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * self.multiplier.powi(attempts as i32);
        let capped = base.min(self.max.as_millis() as f64);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_millis((capped * (1.0 + jitter)).max(0.0) as u64)
    }
}

/// Shared, externally observable worker state.
pub struct WorkerShared {
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub protocol: Protocol,
    state: Mutex<WorkerState>,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_seen: Mutex<Option<DateTime<Utc>>>,
}

impl WorkerShared {
    pub fn new(device_id: DeviceId, tenant_id: TenantId, protocol: Protocol) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            tenant_id,
            protocol,
            state: Mutex::new(WorkerState::Created),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_seen: Mutex::new(None),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!("worker {} state {} -> {}", self.device_id, *state, next);
            *state = next;
        }
    }

    pub fn record_error(&self, error: &WorkerError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn record_seen(&self) {
        *self.last_seen.lock() = Some(Utc::now());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self.last_seen.lock()
    }
}

/// Commands the owner can send a running worker.
pub enum WorkerCommand {
    Pause,
    Resume,
    Stop,
    Write { point_id: PointId, value: Value, reply: oneshot::Sender<Result<()>> },
}

/// The protocol side of a worker. One instance per device; the runner owns
/// it exclusively, so reads and writes are naturally serialised on the
/// connection.
#[async_trait]
pub trait ProtocolWorker: Send {
    /// Open the transport and perform any protocol handshake.
    async fn establish_connection(&mut self) -> Result<()>;

    /// Close the transport. Must be safe to call in any state.
    async fn close_connection(&mut self);

    /// Cheap liveness check of the transport.
    async fn check_connection(&mut self) -> bool;

    /// Protocol-level keep-alive (Modbus probe read, MQTT PINGREQ, BACnet
    /// Who-Is).
    async fn send_keep_alive(&mut self) -> Result<()>;

    /// One unit of protocol work: scan due polling groups, pump incoming
    /// messages, drain publish queues. Returns how long the runner may sleep
    /// before the next cycle.
    async fn poll_cycle(&mut self, queue: &PipelineQueue) -> Result<Duration>;

    /// Scalar write to a point.
    async fn write_point(&mut self, point_id: PointId, value: Value) -> Result<()>;
}

/// Configuration for the runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub backoff: BackoffPolicy,
    pub keep_alive: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            keep_alive: Duration::from_millis(KEEPALIVE_INTERVAL_MS),
        }
    }
}

/// Drive one protocol worker to completion. Returns when stopped.
pub async fn run_worker(
    mut proto: Box<dyn ProtocolWorker>,
    shared: Arc<WorkerShared>,
    queue: Arc<PipelineQueue>,
    mut commands: mpsc::Receiver<WorkerCommand>,
    config: RunnerConfig,
) {
    shared.set_state(WorkerState::Starting);
    let mut attempts: u32 = 0;

    'outer: loop {
        // Connect with backoff; stop commands are honoured mid-backoff.
        shared.set_state(if attempts == 0 {
            WorkerState::Connecting
        } else {
            WorkerState::Reconnecting
        });
        match proto.establish_connection().await {
            Ok(()) => {
                info!("worker {} connected", shared.device_id);
                attempts = 0;
                shared.set_state(WorkerState::Running);
                shared.record_seen();
            }
            Err(e) => {
                shared.record_error(&e);
                let delay = config.backoff.delay(attempts);
                attempts = attempts.saturating_add(1);
                warn!(
                    "worker {} connect attempt {attempts} failed ({e}); retrying in {delay:?}",
                    shared.device_id
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'outer,
                    cmd = commands.recv() => {
                        if handle_idle_command(cmd, &shared).await {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                }
            }
        }

        // Connected: poll until stop or connection loss.
        let mut next_poll = Duration::from_millis(0);
        let mut keep_alive = tokio::time::interval(config.keep_alive);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keep_alive.reset();

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(WorkerCommand::Pause) => {
                            shared.set_state(WorkerState::Paused);
                        }
                        Some(WorkerCommand::Resume) => {
                            if shared.state() == WorkerState::Paused {
                                shared.set_state(WorkerState::Running);
                            }
                        }
                        Some(WorkerCommand::Stop) | None => {
                            break 'outer;
                        }
                        Some(WorkerCommand::Write { point_id, value, reply }) => {
                            let result = if shared.state().is_connected() {
                                proto.write_point(point_id, value).await
                            } else {
                                Err(WorkerError::NotConnected)
                            };
                            match &result {
                                Ok(()) => {
                                    shared.writes.fetch_add(1, Ordering::Relaxed);
                                    shared.record_seen();
                                }
                                Err(e) => shared.record_error(e),
                            }
                            let fatal = result.as_ref().is_err_and(|e| e.is_fatal_to_connection());
                            let _ = reply.send(result);
                            if fatal {
                                break;
                            }
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    if shared.state() == WorkerState::Paused {
                        continue;
                    }
                    if let Err(e) = proto.send_keep_alive().await {
                        shared.record_error(&e);
                        warn!("worker {} keep-alive failed: {e}", shared.device_id);
                        break;
                    }
                    if !proto.check_connection().await {
                        warn!("worker {} connection check failed", shared.device_id);
                        break;
                    }
                    shared.record_seen();
                }
                _ = tokio::time::sleep(next_poll) => {
                    if shared.state() == WorkerState::Paused {
                        next_poll = Duration::from_millis(200);
                        continue;
                    }
                    match proto.poll_cycle(&queue).await {
                        Ok(idle) => {
                            shared.reads.fetch_add(1, Ordering::Relaxed);
                            shared.record_seen();
                            next_poll = idle;
                        }
                        Err(e) => {
                            shared.record_error(&e);
                            if e.is_fatal_to_connection() {
                                warn!("worker {} lost connection: {e}", shared.device_id);
                                break;
                            }
                            // Non-fatal protocol error: brief pause, keep going.
                            next_poll = Duration::from_millis(100);
                        }
                    }
                }
            }
        }

        // Fell out of the connected loop: tear down and reconnect.
        proto.close_connection().await;
        if shared.state() == WorkerState::Stopping || shared.state() == WorkerState::Stopped {
            break;
        }
        shared.set_state(WorkerState::Reconnecting);
    }

    shared.set_state(WorkerState::Stopping);
    proto.close_connection().await;
    shared.set_state(WorkerState::Stopped);
    info!("worker {} stopped", shared.device_id);
}

/// Handle a command that arrives while disconnected. Returns `true` on stop.
async fn handle_idle_command(cmd: Option<WorkerCommand>, shared: &WorkerShared) -> bool {
    match cmd {
        Some(WorkerCommand::Stop) | None => true,
        Some(WorkerCommand::Pause) => {
            shared.set_state(WorkerState::Paused);
            false
        }
        Some(WorkerCommand::Resume) => false,
        Some(WorkerCommand::Write { reply, .. }) => {
            let _ = reply.send(Err(WorkerError::NotConnected));
            false
        }
    }
}
