//! `AgentConfig`: the YAML-deserialized tunables for every batching, TTL,
//! backoff, and supervisor path named in the specification (component N).
//!
//! Loaded once at process start via [`AgentConfig::load`]; immutable for the
//! lifetime of the process. Durations use `humantime_serde` so operators can
//! write `"30s"` / `"24h"` in the YAML file instead of raw milliseconds,
//! matching the pack's convention for human-readable durations.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_max_batch_size() -> usize {
    100
}

fn default_max_batch_size_bytes() -> usize {
    1_000_000
}

fn default_max_batch_duration() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retry_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_id_cache_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_connect_backoff_min() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_max_temp_files() -> usize {
    50
}

fn default_temp_dir() -> String {
    std::env::temp_dir().to_string_lossy().into_owned()
}

fn default_binary_path() -> String {
    "/usr/bin/fluent-bit".to_string()
}

fn default_native_output_plugin() -> String {
    "out_newrelic.so".to_string()
}

fn default_default_parsers_path() -> String {
    "/etc/newrelic-infra/logging.d/parsers.conf".to_string()
}

/// Batching/retry tunables for the register worker (component F).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    pub max_batch_size: usize,
    pub max_batch_size_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub max_batch_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_backoff: Duration,
    pub request_queue_capacity: usize,
    pub verbose: bool,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_size_bytes: default_max_batch_size_bytes(),
            max_batch_duration: default_max_batch_duration(),
            max_retry_backoff: default_max_retry_backoff(),
            request_queue_capacity: default_queue_capacity(),
            verbose: false,
        }
    }
}

/// ID cache tunables (component C).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdCacheConfig {
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(default)]
    pub type_ttls: std::collections::BTreeMap<String, DurationSecondsOrHuman>,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for IdCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_id_cache_ttl(),
            type_ttls: Default::default(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Newtype so `type_ttls` entries parse with the same human-readable
/// duration grammar as every other duration field.
#[derive(Debug, Clone, Copy)]
pub struct DurationSecondsOrHuman(pub Duration);

impl<'de> Deserialize<'de> for DurationSecondsOrHuman {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        humantime_serde::deserialize(deserializer).map(DurationSecondsOrHuman)
    }
}

/// Backoff tunables shared by the connect service and supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: default_connect_backoff_min(),
            max: default_connect_backoff_max(),
            factor: default_backoff_factor(),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn build(&self) -> crate::backoff::Backoff {
        crate::backoff::Backoff::new(self.min, self.max, self.factor, self.jitter)
    }
}

/// Supervisor tunables (component H).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub backoff: BackoffConfig,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    pub temp_dir: String,
    pub max_temp_files: usize,
    pub binary_path: String,
    pub native_output_plugin: String,
    pub default_parsers_path: String,
    pub verbose: bool,
    /// `NR_LICENSE_KEY_ENV_VAR` value passed to the child (§6). Populated
    /// from `AgentConfig.license_key` by `AgentConfig::from_yaml` rather
    /// than read from YAML under `supervisor:` directly, since it is the
    /// same license key every other component authenticates with.
    pub license_key: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            grace_period: default_grace_period(),
            temp_dir: default_temp_dir(),
            max_temp_files: default_max_temp_files(),
            binary_path: default_binary_path(),
            native_output_plugin: default_native_output_plugin(),
            default_parsers_path: default_default_parsers_path(),
            verbose: false,
            license_key: String::new(),
        }
    }
}

/// Config-directory watcher tunables (component I).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigWatchConfig {
    pub directory: String,
}

impl Default for ConfigWatchConfig {
    fn default() -> Self {
        Self { directory: "/etc/newrelic-infra/logging.d".to_string() }
    }
}

/// Top-level agent configuration, deserialized once from YAML at process
/// start (or constructed via `Default` for tests).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub register: RegisterConfig,
    pub id_cache: IdCacheConfig,
    pub connect_backoff: BackoffConfig,
    pub supervisor: SupervisorConfig,
    pub config_watch: ConfigWatchConfig,
    pub license_key: String,
    pub compression_level: Option<u32>,
    pub control_plane_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            register: RegisterConfig::default(),
            id_cache: IdCacheConfig::default(),
            connect_backoff: BackoffConfig::default(),
            supervisor: SupervisorConfig::default(),
            config_watch: ConfigWatchConfig::default(),
            license_key: String::new(),
            compression_level: None,
            control_plane_url: "https://infra-api.newrelic.com".to_string(),
        }
    }
}

impl AgentConfig {
    /// Read and parse a YAML config file. Called once at startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: AgentConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        cfg.supervisor.license_key = cfg.license_key.clone();
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.register.max_batch_size == 0 {
            return Err(ConfigError::Invalid("register.max_batch_size must be > 0".into()));
        }
        if self.register.max_batch_size_bytes == 0 {
            return Err(ConfigError::Invalid("register.max_batch_size_bytes must be > 0".into()));
        }
        if let Some(level) = self.compression_level {
            if level > 9 {
                return Err(ConfigError::Invalid(format!(
                    "compression_level must be 0..=9, got {level}"
                )));
            }
        }
        Ok(())
    }
}
