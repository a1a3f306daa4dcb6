//! Harness configuration
//!
//! One explicit, immutable [`HarnessConfig`] is built at startup (TOML profile
//! plus overrides, handled by the CLI), validated once, and then passed by
//! reference into the components that need it. Validation happens before any
//! worker thread starts; a failure is a configuration error and the process
//! exits non-zero.

use crate::error::{Error, Result};
use phloem_transport::{ChannelOptions, PollerKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Hard cap on worker threads per process
pub const MAX_WORKER_THREADS: usize = 8;

/// Top-level harness configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    pub experiment: ExperimentConfig,
    /// Which side of the protocol this process plays
    pub role: Role,
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
    #[serde(default)]
    pub consumer: Option<ConsumerConfig>,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Process role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Provider,
    Consumer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Provider => write!(f, "provider"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

/// Experiment metadata and run shape
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentConfig {
    /// Experiment name
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// Wall-clock run duration before orderly shutdown
    #[serde(with = "humantime_serde", default = "default_run_time")]
    pub run_time: Duration,
    /// Monitor reporting period
    #[serde(with = "humantime_serde", default = "default_stats_interval")]
    pub write_stats_interval: Duration,
    /// Seed for the latency sampling schedule (None = entropy)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_run_time() -> Duration {
    Duration::from_secs(60)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(5)
}

/// Provider-side traffic shape
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Listen address, e.g. "0.0.0.0:14002"
    pub listen: String,
    /// Updates per second across each worker's connections
    #[serde(default = "default_update_rate")]
    pub update_rate: u64,
    /// How many updates per second carry a latency stamp
    #[serde(default = "default_latency_update_rate")]
    pub latency_update_rate: LatencyRate,
    /// Generic messages per second toward consumers
    #[serde(default)]
    pub generic_rate: u64,
    /// How many generic messages per second carry a latency stamp
    #[serde(default)]
    pub latency_generic_rate: LatencyRate,
    /// Most item streams a single client session may open
    #[serde(default = "default_item_capacity")]
    pub item_capacity: usize,
}

fn default_update_rate() -> u64 {
    100_000
}

fn default_latency_update_rate() -> LatencyRate {
    LatencyRate::PerSec(10)
}

fn default_item_capacity() -> usize {
    100_000
}

/// Consumer-side traffic shape
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Provider address to connect to, e.g. "127.0.0.1:14002"
    pub connect: String,
    /// Item streams requested in total, split across workers
    #[serde(default = "default_item_count")]
    pub item_count: u32,
    /// Item requests per second during startup
    #[serde(default = "default_request_rate")]
    pub request_rate: u64,
    /// Generic messages per second toward the provider once images are in
    #[serde(default)]
    pub generic_rate: u64,
    /// How many of those per second carry a latency stamp
    #[serde(default)]
    pub latency_generic_rate: LatencyRate,
}

fn default_item_count() -> u32 {
    100_000
}

fn default_request_rate() -> u64 {
    50_000
}

/// Tick pacing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PacingConfig {
    /// Ticks per second; every rate is spread over these
    #[serde(default = "default_ticks_per_sec")]
    pub ticks_per_sec: u64,
}

fn default_ticks_per_sec() -> u64 {
    1000
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self { ticks_per_sec: default_ticks_per_sec() }
    }
}

/// Transport tuning passed through to the channel layer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Liveness window for ping tracking
    #[serde(with = "humantime_serde", default = "default_ping_timeout")]
    pub ping_timeout: Duration,
    /// Outbound queue capacity in frames
    #[serde(default = "default_output_buffers")]
    pub guaranteed_output_buffers: usize,
    /// Queued-byte threshold for eager flushing; 0 disables
    #[serde(default)]
    pub high_water_mark: usize,
    /// Largest frame payload either side may send
    #[serde(default = "default_max_fragment_size")]
    pub max_fragment_size: usize,
    #[serde(default)]
    pub send_buf_size: Option<usize>,
    #[serde(default)]
    pub recv_buf_size: Option<usize>,
    #[serde(default = "default_tcp_no_delay")]
    pub tcp_no_delay: bool,
    /// Readiness backend: epoll, poll, select (Linux) or mio (elsewhere).
    /// Unset picks the platform default.
    #[serde(default)]
    pub io_backend: Option<String>,
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_output_buffers() -> usize {
    5000
}

fn default_max_fragment_size() -> usize {
    6144
}

fn default_tcp_no_delay() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_timeout: default_ping_timeout(),
            guaranteed_output_buffers: default_output_buffers(),
            high_water_mark: 0,
            max_fragment_size: default_max_fragment_size(),
            send_buf_size: None,
            recv_buf_size: None,
            tcp_no_delay: default_tcp_no_delay(),
            io_backend: None,
        }
    }
}

/// Worker threading
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThreadsConfig {
    #[serde(default = "default_thread_count")]
    pub count: usize,
}

fn default_thread_count() -> usize {
    1
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self { count: default_thread_count() }
    }
}

/// Statistics output destinations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Per-worker interval stats CSV prefix; worker index is appended
    #[serde(default)]
    pub stats_file: Option<PathBuf>,
    /// Per-worker raw latency sample CSV prefix; worker index is appended
    #[serde(default)]
    pub latency_file: Option<PathBuf>,
    /// Run summary as JSON
    #[serde(default)]
    pub summary_file: Option<PathBuf>,
    /// Log an interval row every write_stats_interval
    #[serde(default = "default_display_interval")]
    pub display_interval_stats: bool,
}

fn default_display_interval() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            stats_file: None,
            latency_file: None,
            summary_file: None,
            display_interval_stats: default_display_interval(),
        }
    }
}

/// Latency sampling rate: off, every message, or a per-second target
///
/// Accepts `"off"`, `"all"`, `-1` (alias for all), `0` (alias for off), or a
/// positive per-second count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyRate {
    #[default]
    Off,
    All,
    PerSec(u64),
}

impl LatencyRate {
    pub fn is_off(&self) -> bool {
        matches!(self, LatencyRate::Off)
    }

    pub fn per_sec(&self) -> Option<u64> {
        match self {
            LatencyRate::PerSec(n) => Some(*n),
            _ => None,
        }
    }
}

impl Serialize for LatencyRate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            LatencyRate::Off => serializer.serialize_str("off"),
            LatencyRate::All => serializer.serialize_str("all"),
            LatencyRate::PerSec(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for LatencyRate {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct RateVisitor;

        impl serde::de::Visitor<'_> for RateVisitor {
            type Value = LatencyRate;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("\"off\", \"all\", or a per-second message count")
            }

            fn visit_str<E: serde::de::Error>(
                self,
                v: &str,
            ) -> std::result::Result<LatencyRate, E> {
                match v.to_lowercase().as_str() {
                    "off" | "none" => Ok(LatencyRate::Off),
                    "all" => Ok(LatencyRate::All),
                    other => Err(E::custom(format!("unknown latency rate: {other}"))),
                }
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<LatencyRate, E> {
                match v {
                    -1 => Ok(LatencyRate::All),
                    0 => Ok(LatencyRate::Off),
                    n if n > 0 => Ok(LatencyRate::PerSec(n as u64)),
                    n => Err(E::custom(format!("negative latency rate: {n}"))),
                }
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<LatencyRate, E> {
                if v == 0 {
                    Ok(LatencyRate::Off)
                } else {
                    Ok(LatencyRate::PerSec(v))
                }
            }
        }

        deserializer.deserialize_any(RateVisitor)
    }
}

impl HarnessConfig {
    /// Check every startup constraint; called once before threads spawn
    pub fn validate(&self) -> Result<()> {
        if self.experiment.name.is_empty() {
            return Err(Error::Config("experiment.name must not be empty".to_string()));
        }
        if self.experiment.run_time.is_zero() {
            return Err(Error::Config("experiment.run_time must be positive".to_string()));
        }
        if self.experiment.write_stats_interval.is_zero() {
            return Err(Error::Config(
                "experiment.write_stats_interval must be positive".to_string(),
            ));
        }

        let ticks = self.pacing.ticks_per_sec;
        if ticks == 0 || ticks > 1_000_000 {
            return Err(Error::Config(format!(
                "pacing.ticks_per_sec must be in 1..=1000000, got {ticks}"
            )));
        }

        let threads = self.threads.count;
        if threads == 0 || threads > MAX_WORKER_THREADS {
            return Err(Error::Config(format!(
                "threads.count must be in 1..={MAX_WORKER_THREADS}, got {threads}"
            )));
        }

        if self.transport.guaranteed_output_buffers == 0 {
            return Err(Error::Config(
                "transport.guaranteed_output_buffers must be positive".to_string(),
            ));
        }
        if self.transport.max_fragment_size < 128 {
            return Err(Error::Config(
                "transport.max_fragment_size must be at least 128".to_string(),
            ));
        }
        if let Some(backend) = &self.transport.io_backend {
            backend.parse::<PollerKind>().map_err(Error::from)?;
        }

        match self.role {
            Role::Provider => {
                let Some(provider) = &self.provider else {
                    return Err(Error::Config(
                        "role = \"provider\" requires a [provider] section".to_string(),
                    ));
                };
                parse_addr("provider.listen", &provider.listen)?;
                validate_rate_pair(
                    "provider.update_rate",
                    provider.update_rate,
                    provider.latency_update_rate,
                    ticks,
                )?;
                validate_rate_pair(
                    "provider.generic_rate",
                    provider.generic_rate,
                    provider.latency_generic_rate,
                    ticks,
                )?;
                if provider.item_capacity == 0 {
                    return Err(Error::Config(
                        "provider.item_capacity must be positive".to_string(),
                    ));
                }
            }
            Role::Consumer => {
                let Some(consumer) = &self.consumer else {
                    return Err(Error::Config(
                        "role = \"consumer\" requires a [consumer] section".to_string(),
                    ));
                };
                parse_addr("consumer.connect", &consumer.connect)?;
                if consumer.item_count == 0 {
                    return Err(Error::Config("consumer.item_count must be positive".to_string()));
                }
                if consumer.request_rate == 0 {
                    return Err(Error::Config(
                        "consumer.request_rate must be positive".to_string(),
                    ));
                }
                validate_rate_pair(
                    "consumer.generic_rate",
                    consumer.generic_rate,
                    consumer.latency_generic_rate,
                    ticks,
                )?;
            }
        }

        Ok(())
    }

    /// Channel tuning derived from the [transport] section
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            ping_timeout: self.transport.ping_timeout,
            guaranteed_output_buffers: self.transport.guaranteed_output_buffers,
            high_water_mark: self.transport.high_water_mark,
            max_fragment_size: self.transport.max_fragment_size,
            send_buf_size: self.transport.send_buf_size,
            recv_buf_size: self.transport.recv_buf_size,
            tcp_no_delay: self.transport.tcp_no_delay,
        }
    }

    /// Readiness backend from the [transport] section, or the platform default
    pub fn poller_kind(&self) -> Result<PollerKind> {
        match &self.transport.io_backend {
            Some(s) => Ok(s.parse()?),
            None => Ok(PollerKind::default()),
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| Error::Config("missing [provider] section".to_string()))?;
        parse_addr("provider.listen", &provider.listen)
    }

    pub fn connect_addr(&self) -> Result<SocketAddr> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| Error::Config("missing [consumer] section".to_string()))?;
        parse_addr("consumer.connect", &consumer.connect)
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .map_err(|e| Error::Config(format!("{field} \"{value}\" is not a socket address: {e}")))
}

/// A sampled latency rate constrains its message rate: samples cannot exceed
/// messages, at most one message per tick can be marked, and the message rate
/// must divide evenly into ticks so every tick's burst is the same size.
fn validate_rate_pair(field: &str, rate: u64, latency: LatencyRate, ticks: u64) -> Result<()> {
    match latency {
        LatencyRate::Off => Ok(()),
        LatencyRate::All => {
            if rate == 0 {
                return Err(Error::Config(format!(
                    "{field} is 0 but its latency rate is \"all\""
                )));
            }
            Ok(())
        }
        LatencyRate::PerSec(n) => {
            if rate == 0 {
                return Err(Error::Config(format!(
                    "{field} is 0 but its latency rate is {n}/s"
                )));
            }
            if n > rate {
                return Err(Error::Config(format!(
                    "latency rate {n}/s exceeds {field} {rate}/s"
                )));
            }
            if n > ticks {
                return Err(Error::Config(format!(
                    "latency rate {n}/s exceeds ticks_per_sec {ticks}; at most one \
                     message per tick can carry a stamp"
                )));
            }
            if rate % ticks != 0 {
                return Err(Error::Config(format!(
                    "{field} {rate}/s does not divide evenly into {ticks} ticks; \
                     sampled latency scheduling needs a uniform burst size"
                )));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_toml() -> &'static str {
        r#"
            role = "provider"

            [experiment]
            name = "bench"

            [provider]
            listen = "127.0.0.1:14002"
        "#
    }

    fn consumer_toml() -> &'static str {
        r#"
            role = "consumer"

            [experiment]
            name = "bench"
            run_time = "30s"
            write_stats_interval = "1s"

            [consumer]
            connect = "127.0.0.1:14002"
            item_count = 1000
            request_rate = 5000
        "#
    }

    #[test]
    fn test_provider_defaults() {
        let config: HarnessConfig = toml::from_str(provider_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.role, Role::Provider);
        let provider = config.provider.as_ref().unwrap();
        assert_eq!(provider.update_rate, 100_000);
        assert_eq!(provider.latency_update_rate, LatencyRate::PerSec(10));
        assert_eq!(provider.generic_rate, 0);
        assert_eq!(config.pacing.ticks_per_sec, 1000);
        assert_eq!(config.threads.count, 1);
        assert_eq!(config.experiment.run_time, Duration::from_secs(60));
        assert_eq!(config.transport.max_fragment_size, 6144);
        assert!(config.transport.tcp_no_delay);
    }

    #[test]
    fn test_consumer_parse() {
        let config: HarnessConfig = toml::from_str(consumer_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.role, Role::Consumer);
        assert_eq!(config.experiment.run_time, Duration::from_secs(30));
        let consumer = config.consumer.as_ref().unwrap();
        assert_eq!(consumer.item_count, 1000);
        assert_eq!(consumer.latency_generic_rate, LatencyRate::Off);
    }

    #[test]
    fn test_latency_rate_forms() {
        #[derive(Deserialize)]
        struct Wrap {
            rate: LatencyRate,
        }

        let cases = [
            ("rate = \"off\"", LatencyRate::Off),
            ("rate = \"all\"", LatencyRate::All),
            ("rate = -1", LatencyRate::All),
            ("rate = 0", LatencyRate::Off),
            ("rate = 250", LatencyRate::PerSec(250)),
        ];
        for (src, expected) in cases {
            let w: Wrap = toml::from_str(src).unwrap();
            assert_eq!(w.rate, expected, "{src}");
        }
        assert!(toml::from_str::<Wrap>("rate = \"sometimes\"").is_err());
        assert!(toml::from_str::<Wrap>("rate = -2").is_err());
    }

    #[test]
    fn test_missing_role_section() {
        let src = r#"
            role = "provider"
            [experiment]
            name = "x"
        "#;
        let config: HarnessConfig = toml::from_str(src).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thread_count_bounds() {
        let mut config: HarnessConfig = toml::from_str(provider_toml()).unwrap();
        config.threads.count = 0;
        assert!(config.validate().is_err());
        config.threads.count = MAX_WORKER_THREADS;
        assert!(config.validate().is_ok());
        config.threads.count = MAX_WORKER_THREADS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_rate_bounds() {
        let mut config: HarnessConfig = toml::from_str(provider_toml()).unwrap();
        config.pacing.ticks_per_sec = 0;
        assert!(config.validate().is_err());
        config.pacing.ticks_per_sec = 2_000_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_latency_rate_constraints() {
        let mut config: HarnessConfig = toml::from_str(provider_toml()).unwrap();

        // More samples than messages
        config.provider.as_mut().unwrap().update_rate = 1000;
        config.provider.as_mut().unwrap().latency_update_rate = LatencyRate::PerSec(2000);
        assert!(config.validate().is_err());

        // More samples than ticks
        config.provider.as_mut().unwrap().update_rate = 100_000;
        config.provider.as_mut().unwrap().latency_update_rate = LatencyRate::PerSec(5000);
        assert!(config.validate().is_err());

        // Message rate that does not divide into the tick cycle
        config.provider.as_mut().unwrap().update_rate = 100_007;
        config.provider.as_mut().unwrap().latency_update_rate = LatencyRate::PerSec(10);
        assert!(config.validate().is_err());

        // Same rate without sampling is fine
        config.provider.as_mut().unwrap().latency_update_rate = LatencyRate::Off;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_addresses_rejected() {
        let mut config: HarnessConfig = toml::from_str(provider_toml()).unwrap();
        config.provider.as_mut().unwrap().listen = "nowhere".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_io_backend_parse() {
        let mut config: HarnessConfig = toml::from_str(provider_toml()).unwrap();
        assert_eq!(config.poller_kind().unwrap(), PollerKind::default());
        config.transport.io_backend = Some("bogus".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_options_mapping() {
        let mut config: HarnessConfig = toml::from_str(provider_toml()).unwrap();
        config.transport.high_water_mark = 4096;
        config.transport.send_buf_size = Some(65536);
        let opts = config.channel_options();
        assert_eq!(opts.high_water_mark, 4096);
        assert_eq!(opts.send_buf_size, Some(65536));
        assert_eq!(opts.guaranteed_output_buffers, 5000);
        assert_eq!(opts.ping_timeout, Duration::from_secs(10));
    }
}
