//! Integration tests for config loading from fixture files.
//!
//! These tests verify that the library types parse the sample config file correctly.

use std::fs;
use std::path::Path;

use media_shrink::transcode::{CodecFilter, CorruptionPolicy};
use serde::Deserialize;

/// Read the sample config file content.
fn read_sample_config() -> String {
    let config_path = Path::new("tests/fixtures/sample_config.toml");
    fs::read_to_string(config_path).expect("Failed to read sample config file")
}

fn vshrink_section() -> toml::Value {
    let value: toml::Value = toml::from_str(&read_sample_config()).expect("should parse");
    value.get("vshrink").cloned().expect("should have vshrink section")
}

#[test]
fn sample_config_file_exists() {
    let config_path = Path::new("tests/fixtures/sample_config.toml");
    assert!(config_path.exists(), "Sample config file should exist");
}

#[test]
fn sample_config_is_valid_toml() {
    let config_content = read_sample_config();
    let result: Result<toml::Value, _> = toml::from_str(&config_content);
    assert!(result.is_ok(), "Sample config should be valid TOML: {:?}", result.err());
}

#[test]
fn vshrink_section_has_expected_structure() {
    let vshrink = vshrink_section();

    for key in [
        "paths",
        "bloat_threshold",
        "max_height",
        "codecs",
        "quality",
        "threads",
        "full_speed",
        "keep_backup",
        "delete",
        "min_shrink",
        "progress_timeout",
        "workers",
        "flush_every",
        "cache",
        "exclude",
        "extensions",
        "corruption_signals",
        "corruption_threshold",
    ] {
        assert!(vshrink.get(key).is_some(), "[vshrink] should have {key}");
    }
}

#[test]
fn config_values_have_correct_types() {
    let vshrink = vshrink_section();

    assert!(vshrink.get("paths").and_then(toml::Value::as_array).is_some());
    assert!(vshrink.get("bloat_threshold").and_then(toml::Value::as_integer).is_some());
    assert!(vshrink.get("min_shrink").and_then(toml::Value::as_float).is_some());
    assert!(vshrink.get("full_speed").and_then(toml::Value::as_bool).is_some());
    assert!(vshrink.get("cache").and_then(toml::Value::as_str).is_some());
}

#[test]
fn bloat_threshold_respects_floor() {
    let vshrink = vshrink_section();
    let threshold = vshrink
        .get("bloat_threshold")
        .and_then(toml::Value::as_integer)
        .expect("should be an integer");
    assert!(threshold >= 500);
}

#[test]
fn codec_filter_parses() {
    #[derive(Deserialize)]
    struct Section {
        codecs: CodecFilter,
    }
    let section: Section = vshrink_section().try_into().expect("should deserialize");
    assert_eq!(section.codecs, CodecFilter::X265);

    let wildcard: Section = toml::from_str(r#"codecs = "x26*""#).expect("should deserialize");
    assert_eq!(wildcard.codecs, CodecFilter::X26x);
    assert!(toml::from_str::<Section>(r#"codecs = "vp9""#).is_err());
}

#[test]
fn corruption_signals_match_defaults() {
    #[derive(Deserialize)]
    struct Section {
        corruption_signals: Vec<(String, u32)>,
        corruption_threshold: u32,
    }
    let section: Section = vshrink_section().try_into().expect("should deserialize");
    let defaults = CorruptionPolicy::default();
    assert_eq!(section.corruption_signals, defaults.signals);
    assert_eq!(section.corruption_threshold, defaults.threshold);
}
