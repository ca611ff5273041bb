//! Logging infrastructure - structured tracing for the reference engine
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Zero cost when disabled (hot counting paths only emit `trace!`)
//! - Console output, or a non-blocking file writer
//! - Optional JSON format for machine consumption

use crate::errors::RefError;
use crate::refs::LifetimePolicy;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, trace, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Flush guard for the file writer; lives as long as the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_level(self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warn => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(RefError::config(format!("unknown log level `{}`", other))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level for this crate's targets
    pub level: LogLevel,
    /// Log file path; console output when absent
    pub log_path: Option<PathBuf>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Override fields from `TYPTHON_REFS_LOG_*` variables
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // TYPTHON_REFS_LOG_LEVEL: trace, debug, info, warn, error
        if let Some(level) = lookup("TYPTHON_REFS_LOG_LEVEL") {
            self.level = match level.parse() {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(value = %level, error = %err, "Ignoring TYPTHON_REFS_LOG_LEVEL; using info");
                    LogLevel::Info
                }
            };
        }

        // TYPTHON_REFS_LOG_FILE: path to log file
        if let Some(path) = lookup("TYPTHON_REFS_LOG_FILE") {
            self.log_path = Some(PathBuf::from(path));
        }

        // TYPTHON_REFS_LOG_JSON: enable JSON format
        if let Some(value) = lookup("TYPTHON_REFS_LOG_JSON") {
            self.json_format = parse_flag(&value);
        }

        // TYPTHON_REFS_LOG_SPANS: show span events
        if let Some(value) = lookup("TYPTHON_REFS_LOG_SPANS") {
            self.show_spans = parse_flag(&value);
        }
    }

    /// Minimal logging for production
    pub fn performance() -> Self {
        Self {
            level: LogLevel::Error,
            ..Self::default()
        }
    }

    /// Verbose logging, including every counting event
    pub fn debug() -> Self {
        Self {
            level: LogLevel::Trace,
            log_path: Some(PathBuf::from("typthon_refbase.log")),
            json_format: false,
            show_spans: true,
        }
    }
}

/// Truthy environment flag: `1`, `true`, `yes`, `on`
pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration.
///
/// Idempotent. If the host already installed a global subscriber, ours is
/// skipped and events go to the host's.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.level));

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let writer = match &config.log_path {
            Some(path) => file_writer(path),
            None => BoxMakeWriter::new(io::stdout),
        };

        let result = if config.json_format {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_span_events(span_events)
                        .with_target(true),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_span_events(span_events)
                        .with_target(true)
                        .with_thread_ids(cfg!(debug_assertions))
                        .with_line_number(cfg!(debug_assertions)),
                )
                .try_init()
        };

        if result.is_err() {
            debug!("Global subscriber already set; keeping the existing one");
        }
    });
}

/// Filter enabling every event of this crate at `level` and above
pub fn default_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::new(format!("typthon_refbase={}", level.as_str()))
}

fn file_writer(path: &Path) -> BoxMakeWriter {
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "typthon_refbase.log".into());

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    BoxMakeWriter::new(non_blocking)
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Engine-specific logging functions
// ============================================================================

/// Log destruction of a managed object
#[inline]
pub fn log_object_destroyed(
    object: *const (),
    refs: *const (),
    policy: LifetimePolicy,
    custom_destroyer: bool,
) {
    trace!(
        event = "object_destroy",
        address = ?object,
        refs = ?refs,
        policy = %policy,
        custom_destroyer,
        "Managed object destroyed"
    );
}

/// Log a promotion that was refused
#[inline]
pub fn log_promotion_denied(refs: *const (), policy: LifetimePolicy, never_acquired: bool) {
    debug!(
        event = "promotion_denied",
        refs = ?refs,
        policy = %policy,
        never_acquired,
        "Weak reference could not be promoted"
    );
}

/// Log the release of a reference block
#[inline]
pub fn log_refs_freed(refs: *const ()) {
    trace!(
        event = "refs_free",
        refs = ?refs,
        "Reference block freed"
    );
}
