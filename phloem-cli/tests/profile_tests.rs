//! Profile loading and --set override tests

use phloem_cli::profile;
use phloem_core::config::{LatencyRate, Role};
use std::io::Write;
use std::time::Duration;

#[test]
fn test_load_provider_profile() {
    let config = profile::load("../profiles/provider.toml", &[])
        .expect("Failed to load provider profile");

    assert_eq!(config.role, Role::Provider);
    assert_eq!(config.experiment.name, "provider-100k");
    assert_eq!(config.experiment.run_time, Duration::from_secs(60));
    assert_eq!(config.experiment.write_stats_interval, Duration::from_secs(5));

    let provider = config.provider.as_ref().expect("provider section");
    assert_eq!(provider.listen, "0.0.0.0:14002");
    assert_eq!(provider.update_rate, 100_000);
    assert_eq!(provider.latency_update_rate, LatencyRate::PerSec(10));
    assert_eq!(provider.generic_rate, 0);
    assert_eq!(provider.item_capacity, 100_000);
}

#[test]
fn test_load_consumer_profile() {
    let config = profile::load("../profiles/consumer.toml", &[])
        .expect("Failed to load consumer profile");

    assert_eq!(config.role, Role::Consumer);
    assert_eq!(config.experiment.name, "consumer-100k");

    let consumer = config.consumer.as_ref().expect("consumer section");
    assert_eq!(consumer.connect, "127.0.0.1:14002");
    assert_eq!(consumer.item_count, 100_000);
    assert_eq!(consumer.request_rate, 50_000);
    assert_eq!(consumer.generic_rate, 1000);
    assert_eq!(consumer.latency_generic_rate, LatencyRate::PerSec(10));
}

#[test]
fn test_overrides_retype_and_validate() {
    let config = profile::load(
        "../profiles/provider.toml",
        &[
            "provider.update_rate=200000".to_string(),
            "provider.latency_update_rate=all".to_string(),
            "experiment.run_time=2m".to_string(),
            "threads.count=4".to_string(),
        ],
    )
    .expect("Failed to apply overrides");

    let provider = config.provider.as_ref().unwrap();
    assert_eq!(provider.update_rate, 200_000);
    assert_eq!(provider.latency_update_rate, LatencyRate::All);
    assert_eq!(config.experiment.run_time, Duration::from_secs(120));
    assert_eq!(config.threads.count, 4);

    // Untouched values survive the override pass
    assert_eq!(config.experiment.name, "provider-100k");
    assert_eq!(config.pacing.ticks_per_sec, 1000);
}

#[test]
fn test_override_connect_address() {
    let config = profile::load(
        "../profiles/consumer.toml",
        &["consumer.connect=10.0.0.1:14002".to_string()],
    )
    .expect("Failed to override connect address");
    assert_eq!(config.consumer.as_ref().unwrap().connect, "10.0.0.1:14002");
}

#[test]
fn test_override_boolean() {
    let config = profile::load(
        "../profiles/provider.toml",
        &["output.display_interval_stats=false".to_string()],
    )
    .unwrap();
    assert!(!config.output.display_interval_stats);
}

#[test]
fn test_override_requires_equals() {
    let result = profile::load("../profiles/provider.toml", &["no-equals".to_string()]);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("Invalid override format"));
}

#[test]
fn test_override_can_fail_validation() {
    let result =
        profile::load("../profiles/provider.toml", &["pacing.ticks_per_sec=0".to_string()]);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("ticks_per_sec"));
}

#[test]
fn test_minimal_profile_gets_defaults() {
    let minimal = r#"
role = "provider"

[experiment]
name = "defaults"

[provider]
listen = "127.0.0.1:14002"
"#;

    let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
    tmpfile.write_all(minimal.as_bytes()).unwrap();
    tmpfile.flush().unwrap();

    let config = profile::load(tmpfile.path(), &[]).unwrap();
    assert_eq!(config.pacing.ticks_per_sec, 1000);
    assert_eq!(config.threads.count, 1);
    assert_eq!(config.transport.guaranteed_output_buffers, 5000);
    assert_eq!(config.experiment.write_stats_interval, Duration::from_secs(5));
    assert!(config.output.display_interval_stats);
    assert!(config.output.summary_file.is_none());
}

#[test]
fn test_override_creates_missing_section() {
    let minimal = r#"
role = "provider"

[experiment]
name = "no-pacing-section"

[provider]
listen = "127.0.0.1:14002"
"#;

    let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
    tmpfile.write_all(minimal.as_bytes()).unwrap();
    tmpfile.flush().unwrap();

    let config = profile::load(tmpfile.path(), &["pacing.ticks_per_sec=500".to_string()])
        .expect("override should create the [pacing] table");
    assert_eq!(config.pacing.ticks_per_sec, 500);
}

#[test]
fn test_missing_profile_file() {
    let result = profile::load("../profiles/does-not-exist.toml", &[]);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("Failed to read profile"));
}
