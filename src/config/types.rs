use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::wal::record::LabelSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub wal: WalConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    pub clients: Vec<ClientConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    pub dir: PathBuf,
    /// Drain watchers before stopping clients on shutdown. When false,
    /// shutdown stops everything immediately and relies on replay.
    #[serde(default)]
    pub drain_on_shutdown: bool,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(with = "humantime_serde", default = "default_min_read_frequency")]
    pub min_read_frequency: Duration,
    #[serde(with = "humantime_serde", default = "default_max_read_frequency")]
    pub max_read_frequency: Duration,
    #[serde(with = "humantime_serde", default = "default_watch_drain_timeout")]
    pub drain_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            min_read_frequency: default_min_read_frequency(),
            max_read_frequency: default_max_read_frequency(),
            drain_timeout: default_watch_drain_timeout(),
        }
    }
}

fn default_min_read_frequency() -> Duration {
    Duration::from_millis(250)
}

fn default_max_read_frequency() -> Duration {
    Duration::from_secs(1)
}

fn default_watch_drain_timeout() -> Duration {
    Duration::from_secs(15)
}

/// Per-entry limits shared by every client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum distinct streams per batch. 0 disables the limit.
    #[serde(default)]
    pub max_streams: usize,
    /// Maximum line length in bytes. 0 disables the limit.
    #[serde(default)]
    pub max_line_size: usize,
    /// Truncate oversized lines instead of dropping them.
    #[serde(default)]
    pub max_line_size_truncate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Unique client name. Derived from a hash of the config when empty.
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(with = "humantime_serde", default = "default_batch_wait")]
    pub batch_wait: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub external_labels: LabelSet,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub drop_rate_limited_batches: bool,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl ClientConfig {
    /// Config with every optional setting at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            url: url.into(),
            tenant_id: String::new(),
            batch_wait: default_batch_wait(),
            batch_size: default_batch_size(),
            timeout: default_timeout(),
            backoff: BackoffConfig::default(),
            external_labels: LabelSet::new(),
            headers: BTreeMap::new(),
            drop_rate_limited_batches: false,
            queue: QueueConfig::default(),
        }
    }
}

fn default_batch_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_size() -> usize {
    1024 * 1024
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde", default = "default_min_period")]
    pub min_period: Duration,
    #[serde(with = "humantime_serde", default = "default_max_period")]
    pub max_period: Duration,
    /// 0 retries forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_period: default_min_period(),
            max_period: default_max_period(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_min_period() -> Duration {
    Duration::from_millis(500)
}

fn default_max_period() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_retries() -> usize {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue capacity in bytes. Converted into a number of batch slots.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(with = "humantime_serde", default = "default_queue_drain_timeout")]
    pub drain_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            drain_timeout: default_queue_drain_timeout(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10 * 1024 * 1024
}

fn default_queue_drain_timeout() -> Duration {
    Duration::from_secs(15)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9080".to_string()
}
