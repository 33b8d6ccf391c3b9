//! Tests for logging configuration and format parsing
//!
//! Covers the pure resolution of settings plus the one-shot installation of the
//! global subscriber.

use homenode::observability::logging::{init_logging, parse_level, LogFormat, LogSettings};
use std::collections::HashMap;
use tracing::Level;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse(" compact "), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for value in ["invalid", "", "xml", "123"] {
        assert_eq!(LogFormat::parse(value), LogFormat::Json, "{value:?}");
    }
}

#[test]
fn test_parse_level_falls_back_to_info() {
    assert_eq!(parse_level("warn"), Level::WARN);
    assert_eq!(parse_level("Trace"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_settings_for_a_field_deployment() {
    let settings = LogSettings::from_lookup(lookup_from(&[
        ("LOG_LEVEL", "warn"),
        ("LOG_FORMAT", "compact"),
        ("LOG_SPANS", "TRUE"),
    ]));

    assert_eq!(settings.level, Level::WARN);
    assert_eq!(settings.format, LogFormat::Compact);
    assert!(settings.include_spans);
}

#[test]
fn test_verbose_flags_override_quiet_environment() {
    let settings = LogSettings::from_lookup(lookup_from(&[("LOG_LEVEL", "error")]));

    assert_eq!(settings.with_verbosity(0).level, Level::ERROR);
    assert_eq!(settings.with_verbosity(1).level, Level::DEBUG);
    assert_eq!(settings.with_verbosity(3).level, Level::TRACE);
}

#[test]
fn test_global_subscriber_installs_once() {
    let settings = LogSettings {
        level: Level::DEBUG,
        format: LogFormat::Compact,
        include_spans: true,
    };

    assert!(init_logging(settings).is_ok());
    assert!(init_logging(LogSettings::default()).is_err());

    let span = homenode::connection_span!(server = "broker.local", port = 1883);
    let _guard = span.enter();
    tracing::debug!("connected");
}
