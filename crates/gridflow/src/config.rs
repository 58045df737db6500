//! Runtime configuration, assembled in `main` and passed by reference.

use gridflow_protocol::defaults::{
    DEFAULT_BATCH_SIZE, DEFAULT_BATCH_WAIT_MS, DEFAULT_DB_URL, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_REDIS_URL,
};
use gridflow_protocol::TenantId;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct GridConfig {
    /// SQLite store URL.
    pub database_url: String,
    /// Redis cache / pub-sub URL.
    pub redis_url: String,
    /// Parquet archive directory for the time series.
    pub archive_dir: PathBuf,
    /// Tenants to serve; empty means every tenant found in the store.
    pub tenants: Vec<TenantId>,
    pub queue_capacity: usize,
    /// Processing pool size; 0 = machine parallelism.
    pub workers: usize,
    pub batch_size: usize,
    pub batch_wait_ms: u64,
    /// Attempts to reach the store/cache before giving up at startup.
    pub startup_retries: u32,
    pub startup_retry_delay_ms: u64,
    /// Skip alarm startup recovery (for tooling runs).
    pub skip_recovery: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DB_URL.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            archive_dir: gridflow_logging::gridflow_home().join("archive"),
            tenants: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_wait_ms: DEFAULT_BATCH_WAIT_MS,
            startup_retries: 5,
            startup_retry_delay_ms: 2_000,
            skip_recovery: false,
        }
    }
}

impl GridConfig {
    /// Validate the knobs a user can break. Errors here exit with code 1.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.is_empty() {
            return Err("database URL must not be empty".into());
        }
        if !self.database_url.starts_with("sqlite:") {
            return Err(format!("unsupported database URL: {}", self.database_url));
        }
        if self.redis_url.is_empty() {
            return Err("redis URL must not be empty".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue capacity must be positive".into());
        }
        if self.batch_size == 0 {
            return Err("batch size must be positive".into());
        }
        Ok(())
    }
}
