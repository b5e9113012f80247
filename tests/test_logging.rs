//! Tests for logging configuration and format parsing
//!
//! Covers the pure parsing helpers and the one-shot subscriber installation
//! used by the binary.

use iothub_transport::observability::logging::{build_filter, parse_level};
use iothub_transport::observability::{init_logging, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("PRETTY"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("Compact"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    assert!(matches!(LogFormat::parse("invalid"), LogFormat::Json));
    assert!(matches!(LogFormat::parse(""), LogFormat::Json));
    assert!(matches!(LogFormat::parse("yaml"), LogFormat::Json));
    // Surrounding whitespace is not trimmed
    assert!(matches!(LogFormat::parse(" pretty "), LogFormat::Json));
}

#[test]
fn test_parse_level_accepts_config_spellings() {
    let cases = [
        ("error", Level::ERROR),
        ("warning", Level::WARN),
        ("WARN", Level::WARN),
        ("info", Level::INFO),
        ("Debug", Level::DEBUG),
        ("trace", Level::TRACE),
        ("verbose", Level::INFO),
        ("", Level::INFO),
    ];

    for (input, expected) in cases {
        assert_eq!(parse_level(input), expected, "Failed for input: {input}");
    }
}

#[test]
fn test_filter_turns_down_noisy_dependencies() {
    if std::env::var("RUST_LOG").is_ok() {
        // RUST_LOG replaces the whole filter
        return;
    }

    let filter = build_filter(Level::DEBUG).to_string().to_lowercase();

    assert!(filter.contains("debug"));
    assert!(filter.contains("rumqttc=warn"));
    assert!(filter.contains("tokio=warn"));
}

#[test]
fn test_init_logging_installs_only_once() {
    let first = init_logging(Level::INFO, LogFormat::Compact, false);
    let second = init_logging(Level::DEBUG, LogFormat::Json, true);

    assert!(first.is_ok());
    assert!(second.is_err());
}
