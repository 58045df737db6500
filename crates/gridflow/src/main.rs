//! Gridflow collector.
//!
//! Usage:
//!     gridflow --database sqlite:gridflow.db --redis redis://127.0.0.1:6379/0
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 mandatory
//! dependency unavailable after the configured retries, 3 unrecoverable
//! internal error.

use clap::Parser;
use gridflow::app::{exit_codes, App};
use gridflow::GridConfig;
use gridflow_logging::LogConfig;
use gridflow_protocol::defaults::{DEFAULT_DB_URL, DEFAULT_REDIS_URL};
use gridflow_protocol::TenantId;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gridflow", about = "Industrial telemetry collector and alarm engine")]
struct Args {
    /// SQLite store URL
    #[arg(long, env = "GRIDFLOW_DATABASE", default_value = DEFAULT_DB_URL)]
    database: String,

    /// Redis cache / pub-sub URL
    #[arg(long, env = "GRIDFLOW_REDIS", default_value = DEFAULT_REDIS_URL)]
    redis: String,

    /// Parquet archive directory (default: <home>/archive)
    #[arg(long, env = "GRIDFLOW_ARCHIVE")]
    archive: Option<PathBuf>,

    /// Tenant ids to serve (repeatable); default: all tenants in the store
    #[arg(long = "tenant")]
    tenants: Vec<i64>,

    /// Pipeline queue capacity
    #[arg(long, default_value_t = gridflow_protocol::defaults::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Processing worker threads (0 = machine parallelism)
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Skip alarm startup recovery
    #[arg(long)]
    skip_recovery: bool,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = gridflow_logging::init_logging(LogConfig {
        app_name: "gridflow",
        verbose: args.verbose,
    }) {
        eprintln!("logging setup failed: {e}");
        std::process::exit(exit_codes::CONFIG);
    }

    let config = GridConfig {
        database_url: args.database,
        redis_url: args.redis,
        archive_dir: args
            .archive
            .unwrap_or_else(|| gridflow_logging::gridflow_home().join("archive")),
        tenants: args.tenants.into_iter().map(TenantId::new).collect(),
        queue_capacity: args.queue_capacity,
        workers: args.workers,
        skip_recovery: args.skip_recovery,
        ..Default::default()
    };
    if let Err(e) = config.validate() {
        error!("configuration error: {e}");
        std::process::exit(exit_codes::CONFIG);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("runtime setup failed: {e}");
            std::process::exit(exit_codes::INTERNAL);
        }
    };

    let code = runtime.block_on(run(&config));
    std::process::exit(code);
}

async fn run(config: &GridConfig) -> i32 {
    info!("Starting gridflow");
    info!("  Database: {}", config.database_url);
    info!("  Cache:    {}", config.redis_url);
    info!("  Archive:  {}", config.archive_dir.display());

    let app = match App::bootstrap(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("dependency bring-up failed: {e:#}");
            return exit_codes::DEPENDENCY;
        }
    };

    if let Err(e) = app.load_catalog(config).await {
        error!("catalog load failed: {e:#}");
        return exit_codes::INTERNAL;
    }

    match app.run_recovery(config).await {
        Ok(stats) if stats.total > 0 => info!(
            "Recovery republished {}/{} active alarms ({} invalid, {} failed)",
            stats.successfully_published, stats.total, stats.invalid, stats.failed
        ),
        Ok(_) => {}
        Err(e) => {
            // Recovery failing wholesale means the pub/sub path is broken.
            error!("alarm recovery failed: {e:#}");
            return exit_codes::DEPENDENCY;
        }
    }

    if let Err(e) = app.start(config).await {
        error!("startup failed: {e:#}");
        app.shutdown().await;
        return exit_codes::INTERNAL;
    }
    info!("gridflow is up");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handling failed: {e}");
        app.shutdown().await;
        return exit_codes::INTERNAL;
    }
    info!("Shutdown requested");
    app.shutdown().await;
    exit_codes::OK
}
