//! Application wiring.
//!
//! Brings up the store and sinks (with bounded retries), loads rules,
//! virtual points and point metadata, runs alarm recovery, starts the
//! processing pool and the workers, and tears everything down in reverse on
//! shutdown.

use crate::config::GridConfig;
use anyhow::{Context, Result};
use gridflow_db::{RelationalStore, SqliteStore};
use gridflow_engine::{
    AlarmEngine, CurrentValueStore, PipelineQueue, PointMeta, ProcessingConfig, ProcessingService,
    RecoveryConfig, RecoveryStats, StartupRecovery, VirtualPointEngine,
};
use gridflow_sinks::{CacheSink, ParquetTimeSeriesSink, RedisCacheSink, TimeSeriesSink};
use gridflow_worker::WorkerManager;
use gridflow_protocol::{PointRef, TenantId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Process exit codes.
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const DEPENDENCY: i32 = 2;
    pub const INTERNAL: i32 = 3;
}

pub struct App {
    pub store: Arc<SqliteStore>,
    pub cache: Arc<dyn CacheSink>,
    pub timeseries: Arc<dyn TimeSeriesSink>,
    pub queue: Arc<PipelineQueue>,
    pub current: Arc<CurrentValueStore>,
    pub vp: Arc<VirtualPointEngine>,
    pub alarms: Arc<AlarmEngine>,
    pub manager: Arc<WorkerManager>,
    pub recovery: Arc<StartupRecovery>,
    processing: ProcessingService,
}

impl App {
    /// Bring up every dependency. Store/cache failures after the configured
    /// retries surface as errors mapped to exit code 2 by the caller.
    pub async fn bootstrap(config: &GridConfig) -> Result<Self> {
        let store = connect_store(config).await?;
        let cache = connect_cache(config).await?;
        let timeseries: Arc<dyn TimeSeriesSink> = Arc::new(
            ParquetTimeSeriesSink::new(config.archive_dir.clone(), 10_000)
                .context("opening parquet archive")?,
        );

        let queue = Arc::new(PipelineQueue::new(config.queue_capacity));
        let current = Arc::new(CurrentValueStore::new());
        let vp = Arc::new(VirtualPointEngine::new());
        let alarms = Arc::new(AlarmEngine::new(store.clone() as Arc<dyn RelationalStore>));
        let manager = Arc::new(WorkerManager::new(
            store.clone() as Arc<dyn RelationalStore>,
            Arc::clone(&queue),
        ));
        let recovery = Arc::new(StartupRecovery::new(
            store.clone() as Arc<dyn RelationalStore>,
            Arc::clone(&cache),
        ));

        let processing = ProcessingService::new(
            ProcessingConfig {
                workers: if config.workers == 0 {
                    ProcessingConfig::default().workers
                } else {
                    config.workers
                },
                batch_size: config.batch_size,
                batch_wait: Duration::from_millis(config.batch_wait_ms),
            },
            Arc::clone(&queue),
            Arc::clone(&vp),
            Arc::clone(&alarms),
            Arc::clone(&current),
            Arc::clone(&cache),
            Arc::clone(&timeseries),
        );

        Ok(Self {
            store,
            cache,
            timeseries,
            queue,
            current,
            vp,
            alarms,
            manager,
            recovery,
            processing,
        })
    }

    /// Tenants to serve: configured, or discovered from the device table.
    async fn tenants(&self, config: &GridConfig) -> Result<Vec<TenantId>> {
        if !config.tenants.is_empty() {
            return Ok(config.tenants.clone());
        }
        let devices = self.store.list_active_devices(None).await?;
        let tenants: BTreeSet<TenantId> = devices.iter().map(|d| d.tenant_id).collect();
        Ok(tenants.into_iter().collect())
    }

    /// Load rules, virtual points and point metadata for every tenant.
    pub async fn load_catalog(&self, config: &GridConfig) -> Result<()> {
        let tenants = self.tenants(config).await?;
        info!("Serving {} tenant(s)", tenants.len());

        let mut metas = Vec::new();
        for &tenant in &tenants {
            self.alarms.load_tenant(tenant).await?;

            for vp in self.store.load_virtualpoints(tenant).await? {
                let id = vp.id;
                metas.push(PointMeta {
                    point: PointRef::VirtualPoint(id),
                    tenant,
                    name: vp.name.clone(),
                    device_id: None,
                    location: None,
                    group: None,
                });
                if let Err(e) = self.vp.register(vp) {
                    warn!("virtual point {id} rejected: {e}");
                }
            }

            for device in self.store.list_active_devices(Some(tenant)).await? {
                for point in self.store.load_datapoints(device.id).await? {
                    metas.push(PointMeta {
                        point: PointRef::DataPoint(point.id),
                        tenant,
                        name: point.name.clone(),
                        device_id: Some(device.id),
                        location: device.location.clone(),
                        group: None,
                    });
                }
            }
        }
        info!(
            "Catalog loaded: {} rules, {} virtual points, {} points",
            self.alarms.rule_count(),
            self.vp.len(),
            metas.len()
        );
        self.alarms.set_point_meta(metas);
        Ok(())
    }

    /// Republish active alarms before accepting new data.
    pub async fn run_recovery(&self, config: &GridConfig) -> Result<RecoveryStats> {
        if config.skip_recovery {
            info!("Alarm recovery skipped by configuration");
            return Ok(RecoveryStats::default());
        }
        let stats = self
            .recovery
            .run(&RecoveryConfig::default())
            .await
            .context("alarm startup recovery")?;
        Ok(stats)
    }

    /// Start the processing pool and all workers.
    pub async fn start(&self, config: &GridConfig) -> Result<()> {
        self.processing.start(tokio::runtime::Handle::current());
        let tenants = self.tenants(config).await?;
        let mut started = 0;
        for tenant in tenants {
            started += self.manager.start_all_active(Some(tenant)).await?;
        }
        info!("{started} workers started");
        Ok(())
    }

    /// Orderly shutdown: workers first (producers), then the pool, then a
    /// final archive flush.
    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
        self.processing.shutdown();
        info!("Shutdown complete; queue stats: {:?}", self.queue.stats());
    }
}

async fn connect_store(config: &GridConfig) -> Result<Arc<SqliteStore>> {
    let mut last_error = None;
    for attempt in 1..=config.startup_retries.max(1) {
        match SqliteStore::connect(&config.database_url).await {
            Ok(store) => return Ok(Arc::new(store)),
            Err(e) => {
                warn!(
                    "store connect attempt {attempt}/{}: {e}",
                    config.startup_retries.max(1)
                );
                last_error = Some(e);
                tokio::time::sleep(Duration::from_millis(config.startup_retry_delay_ms)).await;
            }
        }
    }
    Err(anyhow::Error::from(last_error.unwrap_or_else(|| unreachable!())))
        .context("relational store unavailable")
}

async fn connect_cache(config: &GridConfig) -> Result<Arc<dyn CacheSink>> {
    let mut last_error = None;
    for attempt in 1..=config.startup_retries.max(1) {
        match RedisCacheSink::connect(&config.redis_url, 2_000).await {
            Ok(sink) => return Ok(Arc::new(sink)),
            Err(e) => {
                warn!(
                    "cache connect attempt {attempt}/{}: {e}",
                    config.startup_retries.max(1)
                );
                last_error = Some(e);
                tokio::time::sleep(Duration::from_millis(config.startup_retry_delay_ms)).await;
            }
        }
    }
    Err(anyhow::Error::from(last_error.unwrap_or_else(|| unreachable!())))
        .context("cache/pub-sub unavailable")
}
