//! Structured logging setup using the tracing crate
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the embedding application. The binary calls [`init_logging`] or
//! [`init_default_logging`] once at startup.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE, defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact, defaults to json
//! - `LOG_SPANS`: emit span open/close events (true/false), defaults to false
//! - `RUST_LOG`: replaces the whole filter when set
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG iothub-transport run --config device.toml
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are chatty at debug level
const NOISY_TARGETS: &[&str] = &["rumqttc=warn", "tokio=warn", "rustls=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line, coloured
    Pretty,
    /// Single line, coloured, no target
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; unknown names fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" | "WARNING" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Filter for `level` with the noisy dependencies turned down, unless
/// `RUST_LOG` overrides it.
pub fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    NOISY_TARGETS
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(EnvFilter::new(level.to_string()), EnvFilter::add_directive)
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber.
///
/// Fails when a global subscriber was already installed.
pub fn init_logging(
    level: Level,
    format: LogFormat,
    include_spans: bool,
) -> Result<(), TryInitError> {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    }
}

/// Install the global subscriber from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() -> Result<(), TryInitError> {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans)
}

/// Span covering one transport's tick or lifecycle call
#[macro_export]
macro_rules! transport_span {
    ($($field:tt)*) => {
        tracing::debug_span!("iothub_transport", $($field)*)
    };
}

/// Span covering work done on behalf of one registered device
#[macro_export]
macro_rules! device_span {
    ($($field:tt)*) => {
        tracing::debug_span!("iothub_device", $($field)*)
    };
}

pub use {device_span, transport_span};
