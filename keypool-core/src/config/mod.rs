//! Gateway configuration, loaded from a TOML file.
//!
//! Every section is optional; missing values take the defaults below. The file is
//! validated once at load time so the rest of the crate can rely on the ranges.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

pub mod tiers;

pub use tiers::{PriorityTier, TierConfig, TierTable};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub bucket_store: BucketStoreConfig,
    #[serde(default)]
    pub token_bucket: TokenBucketConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub key_records: KeyRecordsConfig,
}

impl Config {
    /// Loads and validates the config file at `path`.
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.bucket_store.validate()?;
        self.token_bucket.validate()?;
        self.selection.validate()?;
        self.cache.validate()?;
        self.key_records.validate()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
}

impl GatewayConfig {
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketStoreBackend {
    /// Valkey when `KEYPOOL_VALKEY_URL` is set, otherwise the in-process store
    #[default]
    Auto,
    Valkey,
    Memory,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BucketStoreConfig {
    #[serde(default)]
    pub backend: BucketStoreBackend,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Idle buckets expire store-side after this many seconds
    #[serde(default = "default_bucket_ttl_s")]
    pub bucket_ttl_s: u64,
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "keypool".to_string()
}

fn default_bucket_ttl_s() -> u64 {
    3600
}

impl Default for BucketStoreConfig {
    fn default() -> Self {
        Self {
            backend: BucketStoreBackend::default(),
            timeout_ms: default_store_timeout_ms(),
            key_prefix: default_key_prefix(),
            bucket_ttl_s: default_bucket_ttl_s(),
        }
    }
}

impl BucketStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_ttl_s)
    }

    fn validate(&self) -> Result<(), Error> {
        check_range("bucket_store.timeout_ms", self.timeout_ms, 10, 10_000)?;
        check_range("bucket_store.bucket_ttl_s", self.bucket_ttl_s, 60, 86_400)?;
        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "bucket_store.key_prefix must be non-empty and contain no whitespace, got `{}`",
                    self.key_prefix
                ),
            }));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TokenBucketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub fallback_to_random: bool,
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub eviction: EvictionConfig,
}

fn default_true() -> bool {
    true
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_to_random: true,
            tiers: TierTable::default(),
            eviction: EvictionConfig::default(),
        }
    }
}

impl TokenBucketConfig {
    fn validate(&self) -> Result<(), Error> {
        self.tiers.validate()?;
        self.eviction.validate()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EvictionConfig {
    #[serde(default = "default_max_buckets")]
    pub max_buckets: u64,
    #[serde(default = "default_idle_ttl_s")]
    pub idle_ttl_s: u64,
    #[serde(default = "default_eviction_interval_s")]
    pub interval_s: u64,
}

fn default_max_buckets() -> u64 {
    1000
}

fn default_idle_ttl_s() -> u64 {
    3600
}

fn default_eviction_interval_s() -> u64 {
    300
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_buckets: default_max_buckets(),
            idle_ttl_s: default_idle_ttl_s(),
            interval_s: default_eviction_interval_s(),
        }
    }
}

impl EvictionConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_s)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_s)
    }

    fn validate(&self) -> Result<(), Error> {
        check_range(
            "token_bucket.eviction.max_buckets",
            self.max_buckets,
            10,
            10_000,
        )?;
        check_range(
            "token_bucket.eviction.idle_ttl_s",
            self.idle_ttl_s,
            60,
            86_400,
        )?;
        check_range("token_bucket.eviction.interval_s", self.interval_s, 60, 3600)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Random draw with probability proportional to remaining tokens
    #[default]
    Weighted,
    /// Always the key with the most remaining tokens, ties broken uniformly
    Greedy,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionConfig {
    #[serde(default = "default_initial_sample_size")]
    pub initial_sample_size: usize,
    #[serde(default = "default_max_sample_size")]
    pub max_sample_size: usize,
    #[serde(default = "default_sample_growth_factor")]
    pub sample_growth_factor: usize,
    #[serde(default = "default_max_race_retries")]
    pub max_race_retries: usize,
    #[serde(default)]
    pub strategy: SelectionStrategy,
}

fn default_initial_sample_size() -> usize {
    200
}

fn default_max_sample_size() -> usize {
    1000
}

fn default_sample_growth_factor() -> usize {
    2
}

fn default_max_race_retries() -> usize {
    3
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            initial_sample_size: default_initial_sample_size(),
            max_sample_size: default_max_sample_size(),
            sample_growth_factor: default_sample_growth_factor(),
            max_race_retries: default_max_race_retries(),
            strategy: SelectionStrategy::default(),
        }
    }
}

impl SelectionConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.initial_sample_size == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "selection.initial_sample_size must be positive".to_string(),
            }));
        }
        if self.max_sample_size < self.initial_sample_size {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "selection.max_sample_size ({}) must be at least selection.initial_sample_size ({})",
                    self.max_sample_size, self.initial_sample_size
                ),
            }));
        }
        if self.sample_growth_factor < 2 {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "selection.sample_growth_factor must be at least 2, got {}",
                    self.sample_growth_factor
                ),
            }));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub active_keys_ttl_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub snapshot_ttl_ms: u64,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: u64,
    /// When set, the active-key cache is eagerly reloaded on this interval
    #[serde(default)]
    pub refresh_interval_s: Option<u64>,
}

fn default_cache_ttl_ms() -> u64 {
    5000
}

fn default_max_snapshots() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            active_keys_ttl_ms: default_cache_ttl_ms(),
            snapshot_ttl_ms: default_cache_ttl_ms(),
            max_snapshots: default_max_snapshots(),
            refresh_interval_s: None,
        }
    }
}

impl CacheConfig {
    pub fn active_keys_ttl(&self) -> Duration {
        Duration::from_millis(self.active_keys_ttl_ms)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_s.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), Error> {
        check_range("cache.active_keys_ttl_ms", self.active_keys_ttl_ms, 1, 600_000)?;
        check_range("cache.snapshot_ttl_ms", self.snapshot_ttl_ms, 1, 600_000)?;
        if let Some(interval) = self.refresh_interval_s {
            check_range("cache.refresh_interval_s", interval, 1, 3600)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KeyRecordsConfig {
    /// Upper bound on every key record query, including cache reloads and tier lookups
    #[serde(default = "default_key_records_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_key_records_timeout_ms() -> u64 {
    1000
}

impl Default for KeyRecordsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_key_records_timeout_ms(),
        }
    }
}

impl KeyRecordsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), Error> {
        check_range("key_records.timeout_ms", self.timeout_ms, 10, 30_000)
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<(), Error> {
    if !(min..=max).contains(&value) {
        return Err(Error::new(ErrorDetails::Config {
            message: format!("{name} must be between {min} and {max}, got {value}"),
        }));
    }
    Ok(())
}
