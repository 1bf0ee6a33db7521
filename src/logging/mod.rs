//! Logging infrastructure - structured tracing throughout the engine
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels per module
//! - Zero-cost when disabled
//! - Console (non-blocking) or daily rolling file output
//! - Event helpers for the boundary crossings worth auditing

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub use tracing::{debug, error, info, trace, warn};

/// Global logging state; holds the appender guard for the process lifetime
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Compact
    }
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// File with daily rotation
    File { directory: String, prefix: String },
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Show span events (enter/exit)
    pub span_events: bool,
    /// Extra filter directives (e.g., "nativebridge::trampoline=trace")
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // NATIVEBRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("NATIVEBRIDGE_LOG_LEVEL") {
            config.level = parse_level(&level).unwrap_or(Level::INFO);
        }

        // NATIVEBRIDGE_LOG_FORMAT: pretty, compact, json
        if let Ok(format) = std::env::var("NATIVEBRIDGE_LOG_FORMAT") {
            config.format = match format.to_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => LogFormat::Compact,
            };
        }

        // NATIVEBRIDGE_LOG_FILE: directory for rolling log files
        if let Ok(dir) = std::env::var("NATIVEBRIDGE_LOG_FILE") {
            config.output = LogOutput::File {
                directory: dir,
                prefix: "nativebridge".to_string(),
            };
        }

        config.span_events = std::env::var("NATIVEBRIDGE_LOG_SPANS").is_ok();
        config
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Parse a level name; `None` for anything unrecognized
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Idempotent: only the first call installs a subscriber. A subscriber
/// installed elsewhere in the process is left alone.
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| {
        let filter = build_filter(&config);
        let spans = if config.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match &config.output {
            LogOutput::Stdout => tracing_appender::non_blocking(std::io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(std::io::stderr()),
            LogOutput::File { directory, prefix } => {
                tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, prefix))
            }
        };

        let layer = match config.format {
            LogFormat::Pretty => fmt::layer()
                .with_writer(writer)
                .pretty()
                .with_span_events(spans)
                .with_filter(filter)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .with_writer(writer)
                .compact()
                .with_span_events(spans)
                .with_target(true)
                .with_filter(filter)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .with_writer(writer)
                .json()
                .with_span_events(spans)
                .with_filter(filter)
                .boxed(),
        };

        match tracing_subscriber::registry().with(layer).try_init() {
            Ok(()) => Some(guard),
            Err(_) => None,
        }
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "nativebridge={}",
            config.level.as_str().to_lowercase()
        ))
    });

    match &config.filter {
        Some(directives) => directives.split(',').fold(base, |filter, directive| {
            match directive.trim().parse() {
                Ok(d) => filter.add_directive(d),
                Err(_) => {
                    tracing::warn!(directive, "invalid filter directive");
                    filter
                }
            }
        }),
        None => base,
    }
}

// ============================================================================
// Engine event helpers
// ============================================================================

/// Log a native call about to be issued
#[inline]
pub fn log_native_call(library: &str, symbol: &str, slots: usize) {
    trace!(
        target: "nativebridge::call",
        library,
        symbol,
        slots,
        "native call"
    );
}

/// Log a value that failed to marshal
pub fn log_marshal_error(symbol: &str, error: &str) {
    debug!(
        target: "nativebridge::marshal",
        symbol,
        error,
        "marshal error"
    );
}

/// Log a retain/release issued against a native object
#[inline]
pub fn log_refcount(event: &'static str, address: usize) {
    trace!(
        target: "nativebridge::ownership",
        event,
        address = format_args!("{:#x}", address),
        "refcount"
    );
}

/// Log a trampoline registration
pub fn log_closure_registered(id: u64, kind: &str) {
    debug!(
        target: "nativebridge::trampoline",
        id,
        kind,
        "closure registered"
    );
}

/// Log a trampoline release
pub fn log_closure_released(id: u64, reason: &'static str) {
    debug!(
        target: "nativebridge::trampoline",
        id,
        reason,
        "closure released"
    );
}

/// Log a shared library being opened
pub fn log_library_loaded(name: &str, path: &str) {
    info!(
        target: "nativebridge::library",
        name,
        path,
        "library loaded"
    );
}

/// Log engine start
pub fn log_engine_start(application_id: &str) {
    info!(
        target: "nativebridge::lifecycle",
        application_id,
        "engine started"
    );
}

/// Log engine stop
pub fn log_engine_stop(application_id: &str, live_wrappers: usize, live_closures: usize) {
    info!(
        target: "nativebridge::lifecycle",
        application_id,
        live_wrappers,
        live_closures,
        "engine stopped"
    );
}

/// Call timing
pub mod perf {
    use std::time::Instant;
    use tracing::trace;

    /// Time a native call; the duration is logged when the timer drops
    #[must_use]
    pub fn time_call(symbol: &str) -> CallTimer<'_> {
        CallTimer {
            symbol,
            start: Instant::now(),
        }
    }

    pub struct CallTimer<'a> {
        symbol: &'a str,
        start: Instant,
    }

    impl CallTimer<'_> {
        pub fn elapsed_us(&self) -> u64 {
            self.start.elapsed().as_micros() as u64
        }
    }

    impl Drop for CallTimer<'_> {
        fn drop(&mut self) {
            trace!(
                target: "nativebridge::call",
                symbol = self.symbol,
                duration_us = self.elapsed_us(),
                "native return"
            );
        }
    }
}
