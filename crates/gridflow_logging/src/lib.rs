//! Shared logging setup for gridflow binaries.
//!
//! One rolling file under `$GRIDFLOW_HOME/logs` plus a stderr layer, both
//! filtered through `RUST_LOG` with a sane default.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "gridflow=info,gridflow_worker=info,gridflow_engine=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for a gridflow binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rolling file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let writer = RollingWriter::open(log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Gridflow home directory: `$GRIDFLOW_HOME` or `~/.gridflow`.
pub fn gridflow_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("GRIDFLOW_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|h| h.join(".gridflow"))
        .unwrap_or_else(|| PathBuf::from(".gridflow"))
}

/// Logs directory under the gridflow home.
pub fn logs_dir() -> PathBuf {
    gridflow_home().join("logs")
}

fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-capped appender that keeps `MAX_LOG_FILES` rotations.
struct Appender {
    dir: PathBuf,
    base_name: String,
    file: File,
    current_size: u64,
}

impl Appender {
    fn open(dir: PathBuf, base_name: String) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{base_name}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        let mut appender = Self { dir, base_name, file, current_size };
        if appender.current_size > MAX_LOG_FILE_SIZE {
            appender.rotate()?;
        }
        Ok(appender)
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{index}", self.base_name))
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();

        let oldest = self.rotated_path(MAX_LOG_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (1..MAX_LOG_FILES - 1).rev() {
            let src = self.rotated_path(idx);
            if src.exists() {
                fs::rename(&src, self.rotated_path(idx + 1))?;
            }
        }
        let current = self.current_path();
        if current.exists() {
            fs::rename(&current, self.rotated_path(1))?;
        }

        self.file = OpenOptions::new().create(true).append(true).open(self.current_path())?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for Appender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let bytes = self.file.write(buf)?;
        self.current_size += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Clonable `MakeWriter` over the shared appender.
#[derive(Clone)]
struct RollingWriter {
    inner: Arc<Mutex<Appender>>,
}

impl RollingWriter {
    fn open(dir: PathBuf, base_name: &str) -> Result<Self> {
        let sanitized: String = base_name
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
            .collect();
        let appender = Appender::open(dir, sanitized)
            .with_context(|| format!("Failed to open log file for {base_name}"))?;
        Ok(Self { inner: Arc::new(Mutex::new(appender)) })
    }
}

struct RollingWriterGuard {
    inner: Arc<Mutex<Appender>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RollingWriterGuard { inner: Arc::clone(&self.inner) }
    }
}

impl Write for RollingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_bounded_file_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut appender = Appender::open(dir.path().to_path_buf(), "test".into()).unwrap();
        for _ in 0..4 {
            appender.rotate().unwrap();
            appender.write_all(b"entry\n").unwrap();
        }
        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert!(names.len() <= MAX_LOG_FILES);
        assert!(names.contains(&"test.log".to_string()));
    }
}
