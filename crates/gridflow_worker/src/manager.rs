//! Worker manager.
//!
//! Owns the `device id -> worker` registry and the factory that turns a
//! device's protocol descriptor into a running worker. The registry lock is
//! never held across protocol I/O: handles are cloned out under the lock and
//! spoken to after it is released.

use crate::base::{run_worker, RunnerConfig, WorkerCommand, WorkerShared, WorkerState};
use crate::bacnet::BacnetWorker;
use crate::error::{Result, WorkerError};
use crate::modbus_rtu::ModbusRtuWorker;
use crate::modbus_tcp::ModbusTcpWorker;
use crate::mqtt::MqttWorker;
use gridflow_db::RelationalStore;
use gridflow_engine::control::WorkerStatusInfo;
use gridflow_engine::queue::PipelineQueue;
use gridflow_protocol::{ConnectionConfig, DeviceId, PointId, TenantId, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{info, warn};

const COMMAND_CHANNEL_DEPTH: usize = 32;
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A live worker as seen by the manager.
pub struct WorkerHandle {
    pub device_id: DeviceId,
    shared: Arc<WorkerShared>,
    commands: mpsc::Sender<WorkerCommand>,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn status(&self) -> WorkerStatusInfo {
        WorkerStatusInfo {
            device_id: self.device_id,
            protocol: self.shared.protocol.name().to_string(),
            state: self.shared.state().name().to_string(),
            connected: self.shared.state().is_connected(),
            reads: self.shared.reads.load(std::sync::atomic::Ordering::Relaxed),
            writes: self.shared.writes.load(std::sync::atomic::Ordering::Relaxed),
            errors: self.shared.errors.load(std::sync::atomic::Ordering::Relaxed),
            last_error: self.shared.last_error(),
            last_seen: self.shared.last_seen(),
        }
    }

    async fn send(&self, command: WorkerCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| WorkerError::Stopped)
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(WorkerCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(WorkerCommand::Resume).await
    }

    /// Stop the worker and wait (bounded) for its task to finish.
    pub async fn stop(&self) {
        let _ = self.commands.send(WorkerCommand::Stop).await;
        let join = self.join.lock().take();
        if let Some(join) = join {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, join).await.is_err() {
                warn!("worker {} did not stop within {STOP_JOIN_TIMEOUT:?}", self.device_id);
            }
        }
    }

    /// Route a scalar write to the live worker; fails fast when the worker
    /// is not connected.
    pub async fn write_point(&self, point_id: PointId, value: Value) -> Result<()> {
        if !self.shared.state().is_connected() {
            return Err(WorkerError::NotConnected);
        }
        let (reply, wait) = oneshot::channel();
        self.send(WorkerCommand::Write { point_id, value, reply }).await?;
        match tokio::time::timeout(STOP_JOIN_TIMEOUT, wait).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::Stopped),
            Err(_) => Err(WorkerError::Timeout),
        }
    }
}

pub struct WorkerManager {
    store: Arc<dyn RelationalStore>,
    queue: Arc<PipelineQueue>,
    registry: Mutex<HashMap<DeviceId, Arc<WorkerHandle>>>,
    /// One lock per serial port path, shared by every RTU worker on it.
    bus_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    runner_config: RunnerConfig,
}

impl WorkerManager {
    pub fn new(store: Arc<dyn RelationalStore>, queue: Arc<PipelineQueue>) -> Self {
        Self {
            store,
            queue,
            registry: Mutex::new(HashMap::new()),
            bus_locks: Mutex::new(HashMap::new()),
            runner_config: RunnerConfig::default(),
        }
    }

    pub fn with_runner_config(mut self, config: RunnerConfig) -> Self {
        self.runner_config = config;
        self
    }

    fn bus_lock(&self, port: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.bus_locks
                .lock()
                .entry(port.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn handle(&self, device_id: DeviceId) -> Option<Arc<WorkerHandle>> {
        self.registry.lock().get(&device_id).cloned()
    }

    /// Start a worker for the device. Starting a running worker is a no-op
    /// success; the first connection attempt's outcome surfaces through the
    /// worker's status.
    pub async fn start(&self, device_id: DeviceId) -> Result<()> {
        if let Some(existing) = self.handle(device_id) {
            if existing.state() != WorkerState::Stopped {
                return Ok(());
            }
            // Stale handle from a previous run.
            self.registry.lock().remove(&device_id);
        }

        let device = self.store.load_device(device_id).await?;
        let points = self.store.load_datapoints(device_id).await?;
        let tenant = device.tenant_id;

        let proto: Box<dyn crate::base::ProtocolWorker> = match device.connection {
            ConnectionConfig::ModbusTcp(params) => {
                Box::new(ModbusTcpWorker::new(device_id, tenant, params, &points))
            }
            ConnectionConfig::ModbusRtu(params) => {
                let bus = self.bus_lock(&params.serial_port);
                Box::new(ModbusRtuWorker::new(device_id, tenant, params, &points, bus))
            }
            ConnectionConfig::Bacnet(params) => {
                Box::new(BacnetWorker::new(device_id, tenant, params, &points))
            }
            ConnectionConfig::Mqtt(params) => {
                Box::new(MqttWorker::new(device_id, tenant, params, &points))
            }
        };

        let shared = WorkerShared::new(device_id, tenant, device.protocol);
        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let join = tokio::spawn(run_worker(
            proto,
            Arc::clone(&shared),
            Arc::clone(&self.queue),
            receiver,
            self.runner_config.clone(),
        ));

        let handle = Arc::new(WorkerHandle {
            device_id,
            shared,
            commands,
            join: Mutex::new(Some(join)),
        });
        self.registry.lock().insert(device_id, handle);
        info!("worker {device_id} ({}) started", device.protocol);
        Ok(())
    }

    /// Stop and forget a worker. Stopping a missing worker is a success.
    pub async fn stop(&self, device_id: DeviceId) -> Result<()> {
        let removed = self.registry.lock().remove(&device_id);
        if let Some(handle) = removed {
            handle.stop().await;
        }
        Ok(())
    }

    pub async fn pause(&self, device_id: DeviceId) -> Result<()> {
        self.handle(device_id).ok_or(WorkerError::Stopped)?.pause().await
    }

    pub async fn resume(&self, device_id: DeviceId) -> Result<()> {
        self.handle(device_id).ok_or(WorkerError::Stopped)?.resume().await
    }

    pub async fn restart(&self, device_id: DeviceId) -> Result<()> {
        self.stop(device_id).await?;
        self.start(device_id).await
    }

    pub async fn write_point(&self, device_id: DeviceId, point_id: PointId, value: Value) -> Result<()> {
        self.handle(device_id)
            .ok_or(WorkerError::Stopped)?
            .write_point(point_id, value)
            .await
    }

    /// Command a digital output.
    pub async fn control_digital(&self, device_id: DeviceId, output_id: PointId, on: bool) -> Result<()> {
        self.write_point(device_id, output_id, Value::Bool(on)).await
    }

    /// Command an analog output.
    pub async fn control_analog(&self, device_id: DeviceId, output_id: PointId, value: f64) -> Result<()> {
        self.write_point(device_id, output_id, Value::Float(value)).await
    }

    pub fn status(&self, device_id: DeviceId) -> Option<WorkerStatusInfo> {
        self.handle(device_id).map(|h| h.status())
    }

    pub fn list(&self) -> Vec<WorkerStatusInfo> {
        let mut out: Vec<WorkerStatusInfo> =
            self.registry.lock().values().map(|h| h.status()).collect();
        out.sort_by_key(|s| s.device_id);
        out
    }

    /// Start a worker for every enabled device, optionally per tenant.
    /// Returns how many started (already-running workers count).
    pub async fn start_all_active(&self, tenant: Option<TenantId>) -> Result<usize> {
        let devices = self.store.list_active_devices(tenant).await?;
        let mut started = 0;
        for device in devices {
            match self.start(device.id).await {
                Ok(()) => started += 1,
                Err(e) => warn!("could not start worker for device {}: {e}", device.id),
            }
        }
        Ok(started)
    }

    pub async fn stop_all(&self) {
        let handles: Vec<Arc<WorkerHandle>> =
            self.registry.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop().await;
        }
        info!("all workers stopped");
    }
}
