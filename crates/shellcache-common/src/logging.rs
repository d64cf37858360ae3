//! Logging setup for hosts and tests.
//!
//! One global `tracing` subscriber: an [`EnvFilter`] plus a single fmt layer
//! whose format and writer come from [`LogConfig`].

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter, TestWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Errors raised while installing the global subscriber.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogTarget {
    #[default]
    Stdout,
    /// libtest's captured output, shown only for failing tests.
    TestCapture,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when neither `filter` nor `RUST_LOG` is set.
    pub level: Level,
    pub format: LogFormat,
    pub target: LogTarget,
    /// Include source file and line.
    pub include_location: bool,
    /// Directive string such as `"shellcache_sw=debug,reqwest=warn"`.
    /// Overrides `RUST_LOG`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            target: LogTarget::Stdout,
            include_location: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Debug level with source locations.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            ..Default::default()
        }
    }

    /// JSON lines at info level.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Compact debug output routed through the test harness.
    pub fn for_tests() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Compact,
            target: LogTarget::TestCapture,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match self.filter {
            Some(ref custom) => EnvFilter::try_new(custom).map_err(|e| LoggingError::InvalidFilter {
                filter: custom.clone(),
                reason: e.to_string(),
            }),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    fn writer(&self) -> BoxMakeWriter {
        match self.target {
            LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogTarget::TestCapture => BoxMakeWriter::new(TestWriter::new()),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = fmt::layer()
            .with_writer(self.writer())
            .with_target(true)
            .with_file(self.include_location)
            .with_line_number(self.include_location);

        match self.format {
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Json => base.json().boxed(),
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// A second call returns [`LoggingError::AlreadyInitialized`] instead of
/// panicking, so every test can call it.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    let filter = config.env_filter()?;

    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
