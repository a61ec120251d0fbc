//! Common logging configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Enable console output (written to stderr)
    pub console: bool,
    /// Enable file output, rotated daily
    pub file: Option<String>,
    /// Log format (json, pretty, compact)
    pub format: LogFormat,
    /// Enable ANSI colors in console output
    pub ansi: bool,
    /// Include span events
    pub span_events: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(Error::invalid_input(format!("Unknown log format: {}", other))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: None,
            format: LogFormat::Compact,
            ansi: true,
            span_events: false,
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn env_filter(level: &str) -> Result<EnvFilter> {
    // RUST_LOG wins over the configured level
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::config(format!("Invalid log level: {}", e)))
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool, span_events: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let spans = if span_events {
        FmtSpan::FULL
    } else {
        FmtSpan::NONE
    };
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_span_events(spans)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_span_events(spans)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_span_events(spans)
            .boxed(),
    }
}

/// Initialize logging with the given configuration
///
/// Returns a guard that must be kept alive for file logging to work
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    // Console layer
    if config.console {
        let layer = format_layer(config.format, std::io::stderr, config.ansi, config.span_events);
        layers.push(layer.with_filter(env_filter(&config.level)?).boxed());
    }

    // File layer
    if let Some(file_path) = &config.file {
        let path = Path::new(file_path);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("icepp.log");
        let file_appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let layer = format_layer(config.format, non_blocking, false, config.span_events);
        layers.push(layer.with_filter(env_filter(&config.level)?).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}
