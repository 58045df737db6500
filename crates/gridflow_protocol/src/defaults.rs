//! Canonical default values shared across the collector.

/// Pipeline queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;
/// Fraction of capacity at which the queue starts dropping.
pub const QUEUE_HIGH_WATER_RATIO: f64 = 0.9;
/// Batch size pulled by one processing worker per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 256;
/// Max wait for a batch before the processing loop re-checks shutdown.
pub const DEFAULT_BATCH_WAIT_MS: u64 = 250;

/// Reconnect backoff: initial delay.
pub const BACKOFF_INITIAL_MS: u64 = 500;
/// Reconnect backoff: multiplier per attempt.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;
/// Reconnect backoff: cap.
pub const BACKOFF_MAX_MS: u64 = 60_000;
/// Reconnect backoff: jitter fraction (±).
pub const BACKOFF_JITTER: f64 = 0.1;

/// Worker keep-alive interval.
pub const KEEPALIVE_INTERVAL_MS: u64 = 10_000;

/// Startup recovery: publish retry attempts per alarm.
pub const RECOVERY_RETRY_ATTEMPTS: u32 = 3;
/// Startup recovery: delay between retries.
pub const RECOVERY_RETRY_DELAY_MS: u64 = 500;
/// Startup recovery: max occurrences loaded per pass.
pub const RECOVERY_BATCH_CAP: usize = 10_000;

/// Bounded attempts for occurrence persistence before falling back to
/// publish-only.
pub const PERSIST_RETRY_ATTEMPTS: u32 = 3;

/// Default store URL.
pub const DEFAULT_DB_URL: &str = "sqlite:gridflow.db";
/// Default cache / pub-sub URL.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
