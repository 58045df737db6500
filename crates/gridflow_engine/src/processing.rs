//! Data processing service.
//!
//! N dedicated threads drain the pipeline queue in batches. Per batch, the
//! stages run in a fixed order: virtual points, alarm evaluation over the
//! merged set, current-value persistence, time-series write, pub/sub
//! fan-out. Sink failures are counted and never abort the batch. The threads
//! drive the async sinks through a runtime handle; everything CPU-bound
//! stays off the reactor.

use crate::alarm::AlarmEngine;
use crate::current::CurrentValueStore;
use crate::metrics::METRICS;
use crate::queue::PipelineQueue;
use crate::vp::VirtualPointEngine;
use gridflow_protocol::defaults::{DEFAULT_BATCH_SIZE, DEFAULT_BATCH_WAIT_MS};
use gridflow_sinks::{CacheSink, TimeSeriesSink};
use gridflow_protocol::{
    channels, ChangeFlags, DeviceDataMessage, TimestampedValue, ValueChangedEvent,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Worker thread count; defaults to the machine's parallelism.
    pub workers: usize,
    pub batch_size: usize,
    pub batch_wait: Duration,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_wait: Duration::from_millis(DEFAULT_BATCH_WAIT_MS),
        }
    }
}

struct Stages {
    queue: Arc<PipelineQueue>,
    vp: Arc<VirtualPointEngine>,
    alarms: Arc<AlarmEngine>,
    current: Arc<CurrentValueStore>,
    cache: Arc<dyn CacheSink>,
    timeseries: Arc<dyn TimeSeriesSink>,
}

pub struct ProcessingService {
    stages: Arc<Stages>,
    config: ProcessingConfig,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ProcessingService {
    pub fn new(
        config: ProcessingConfig,
        queue: Arc<PipelineQueue>,
        vp: Arc<VirtualPointEngine>,
        alarms: Arc<AlarmEngine>,
        current: Arc<CurrentValueStore>,
        cache: Arc<dyn CacheSink>,
        timeseries: Arc<dyn TimeSeriesSink>,
    ) -> Self {
        Self {
            stages: Arc::new(Stages { queue, vp, alarms, current, cache, timeseries }),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker threads. `handle` is the runtime the async sinks
    /// live on.
    pub fn start(&self, handle: tokio::runtime::Handle) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }
        info!("Starting {} processing workers", self.config.workers);
        for worker_index in 0..self.config.workers.max(1) {
            let stages = Arc::clone(&self.stages);
            let shutdown = Arc::clone(&self.shutdown);
            let handle = handle.clone();
            let batch_size = self.config.batch_size;
            let batch_wait = self.config.batch_wait;
            threads.push(
                std::thread::Builder::new()
                    .name(format!("gf-proc-{worker_index}"))
                    .spawn(move || {
                        worker_loop(&stages, &shutdown, &handle, batch_size, batch_wait);
                    })
                    .expect("spawn processing worker"),
            );
        }
    }

    /// Signal shutdown and join the pool.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stages.queue.wake_all();
        for thread in self.threads.lock().drain(..) {
            if thread.join().is_err() {
                warn!("A processing worker panicked during shutdown");
            }
        }
        info!("Processing service stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.threads.lock().is_empty() && !self.shutdown.load(Ordering::SeqCst)
    }
}

fn worker_loop(
    stages: &Stages,
    shutdown: &AtomicBool,
    handle: &tokio::runtime::Handle,
    batch_size: usize,
    batch_wait: Duration,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let batch = stages.queue.get_batch(batch_size, batch_wait);
        if batch.is_empty() {
            // Idle slot: keep periodic virtual points fresh.
            let periodic = stages.vp.compute_periodic(&stages.current);
            if !periodic.is_empty() {
                handle.block_on(process_values(stages, periodic));
            }
            continue;
        }
        let started = Instant::now();
        handle.block_on(process_batch(stages, batch));
        METRICS.batches_processed.fetch_add(1, Ordering::Relaxed);
        METRICS
            .batch_time_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    }
}

async fn process_batch(stages: &Stages, batch: Vec<DeviceDataMessage>) {
    let mut values: Vec<TimestampedValue> =
        batch.into_iter().flat_map(|msg| msg.values).collect();
    if values.is_empty() {
        return;
    }

    // Stage 1: virtual points over the batch (+ store for absent inputs).
    let derived = stages.vp.compute_for_batch(&values, &stages.current);
    values.extend(derived);

    process_values(stages, values).await;
}

/// Stages 2..5 over an already-merged value set.
async fn process_values(stages: &Stages, values: Vec<TimestampedValue>) {
    METRICS.values_processed.fetch_add(values.len() as u64, Ordering::Relaxed);

    // Stage 2: alarm evaluation (persists occurrences internally).
    let alarm_events = stages.alarms.evaluate_batch(&values, &stages.current).await;

    // Stage 3: current values; remember per-value change flags for stage 5.
    let mut flagged: Vec<(TimestampedValue, ChangeFlags)> = Vec::with_capacity(values.len());
    for mut tv in values {
        let flags = stages.current.apply(&tv);
        tv.change_flags = flags;
        if flags != ChangeFlags::empty() {
            if let Some(current) = stages.current.get(tv.tenant_id, tv.point) {
                let json = match serde_json::to_string(&current) {
                    Ok(json) => json,
                    Err(e) => {
                        debug!("current value for {} not serialisable: {e}", tv.point);
                        continue;
                    }
                };
                if let Err(e) =
                    stages.cache.set_current_value(tv.tenant_id, tv.point, json).await
                {
                    METRICS.cache_write_failures.fetch_add(1, Ordering::Relaxed);
                    debug!("cache write for {} failed: {e}", tv.point);
                }
            }
        }
        flagged.push((tv, flags));
    }

    // Stage 4: time series.
    let rows: Vec<TimestampedValue> = flagged.iter().map(|(tv, _)| tv.clone()).collect();
    if let Err(e) = stages.timeseries.write_points(&rows).await {
        METRICS.timeseries_write_failures.fetch_add(1, Ordering::Relaxed);
        warn!("time-series write failed for {} rows: {e}", rows.len());
    }

    // Stage 5: fan-out. Value events only for actual changes.
    for (tv, flags) in &flagged {
        if !flags.contains(ChangeFlags::VALUE_CHANGED) && !flags.contains(ChangeFlags::QUALITY_CHANGED)
        {
            continue;
        }
        let event = ValueChangedEvent {
            point_id: tv.point,
            tenant_id: tv.tenant_id,
            value: tv.value.clone(),
            quality: tv.quality.tag().to_string(),
            ts_source: tv.source_timestamp,
            ts_received: tv.received_timestamp,
        };
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = stages.cache.publish(channels::VALUE_CHANGED, payload).await {
                    METRICS.publish_failures.fetch_add(1, Ordering::Relaxed);
                    debug!("value_changed publish failed: {e}");
                }
            }
            Err(e) => debug!("value_changed for {} not serialisable: {e}", tv.point),
        }
    }
    for event in alarm_events {
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = stages.cache.publish(event.channel(), payload).await {
                    METRICS.publish_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("alarm event publish failed for occurrence {}: {e}", event.occurrence_id);
                }
            }
            Err(e) => warn!("alarm event not serialisable: {e}"),
        }
    }
}
