//! Logging setup
//!
//! Console output is always on. When a log directory is configured every event
//! is also written to a daily-rolling `hamgr.log` there. `RUST_LOG` overrides
//! the configured level for both outputs.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const LOG_FILE_NAME: &str = "hamgr.log";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Enables file logging when set
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// Unknown levels fall back to INFO
    pub fn from_config(level: &str, log_dir: Option<String>) -> Self {
        Self {
            level: level.parse().unwrap_or(Level::INFO),
            log_dir: log_dir.map(PathBuf::from),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Keeps the file writer alive; buffered output is flushed on drop
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_filter(config.filter());
    layers.push(Box::new(console_layer));

    let mut file_guard = None;
    if let Some(ref log_dir) = config.log_dir {
        std::fs::create_dir_all(log_dir)?;

        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(config.filter());
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("fail to initialize logging: {}", e))?;

    if let Some(ref log_dir) = config.log_dir {
        tracing::info!(log_dir = %log_dir.display(), "file logging initialized");
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
