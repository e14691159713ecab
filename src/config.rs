use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the lanrtt agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// PID file guarding against a second instance. Empty disables it.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Conntrack process configuration.
    #[serde(default)]
    pub conntrack: ConntrackConfig,

    /// Flow correlation and buffering configuration.
    #[serde(default)]
    pub flows: FlowsConfig,

    /// Aggregation configuration.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Prometheus exporter configuration.
    #[serde(default)]
    pub exporter: ExporterConfig,
}

/// How the `conntrack` event stream is produced.
#[derive(Debug, Clone, Deserialize)]
pub struct ConntrackConfig {
    /// Path or name of the conntrack binary. Default: "conntrack".
    #[serde(default = "default_conntrack_binary")]
    pub binary: String,

    /// LAN network address passed to `--orig-src`.
    #[serde(default = "default_network")]
    pub network: String,

    /// Subnet mask passed to `--mask-src`.
    #[serde(default = "default_mask")]
    pub mask: String,

    /// Run until stopped instead of for `polling_time`. Default: false.
    #[serde(default)]
    pub continuous: bool,

    /// How long a non-continuous run lasts. Default: 300s.
    #[serde(default = "default_polling_time", with = "humantime_serde")]
    pub polling_time: Duration,

    /// Netlink socket buffer size handed to `--buffer-size`. Default: 1064960.
    #[serde(default = "default_netlink_buffer_size")]
    pub netlink_buffer_size: usize,

    /// Log every parsed event at info level. Default: false.
    #[serde(default)]
    pub log_events: bool,
}

/// What to do with a second opening event for an already pending flow id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateOpenPolicy {
    /// The newer opening event replaces the stored one.
    #[default]
    Replace,
    /// The first opening event is kept; later ones are retransmissions.
    Keep,
}

/// Flow correlation and buffering configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowsConfig {
    /// Maximum correlated flows kept for the rolling mean. Default: 2000.
    #[serde(default = "default_flow_capacity")]
    pub capacity: usize,

    /// Duplicate opening event policy. Default: replace.
    #[serde(default)]
    pub duplicate_open: DuplicateOpenPolicy,

    /// Pending opening events older than this (event clock) are dropped.
    /// Zero disables expiry. Default: 120s.
    #[serde(default = "default_pending_ttl", with = "humantime_serde")]
    pub pending_ttl: Duration,

    /// Require both address/port tuples to match, not just the flow id.
    #[serde(default)]
    pub strict_tuple_match: bool,
}

/// Aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Aggregation period. Default: 5s.
    #[serde(default = "default_stats_period", with = "humantime_serde")]
    pub period: Duration,

    /// Log each tick's statistics at info level. Default: false.
    #[serde(default)]
    pub verbose: bool,
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Listen address. Default: ":1986".
    #[serde(default = "default_exporter_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/lanrtt.pid")
}

fn default_conntrack_binary() -> String {
    "conntrack".to_string()
}

fn default_network() -> String {
    "127.0.0.1".to_string()
}

fn default_mask() -> String {
    "255.255.240.0".to_string()
}

fn default_polling_time() -> Duration {
    Duration::from_secs(300)
}

fn default_netlink_buffer_size() -> usize {
    1_064_960
}

fn default_flow_capacity() -> usize {
    2000
}

fn default_pending_ttl() -> Duration {
    Duration::from_secs(120)
}

fn default_stats_period() -> Duration {
    Duration::from_secs(5)
}

fn default_exporter_addr() -> String {
    ":1986".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            pid_file: default_pid_file(),
            conntrack: ConntrackConfig::default(),
            flows: FlowsConfig::default(),
            stats: StatsConfig::default(),
            exporter: ExporterConfig::default(),
        }
    }
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            binary: default_conntrack_binary(),
            network: default_network(),
            mask: default_mask(),
            continuous: false,
            polling_time: default_polling_time(),
            netlink_buffer_size: default_netlink_buffer_size(),
            log_events: false,
        }
    }
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            capacity: default_flow_capacity(),
            duplicate_open: DuplicateOpenPolicy::default(),
            pending_ttl: default_pending_ttl(),
            strict_tuple_match: false,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            period: default_stats_period(),
            verbose: false,
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            addr: default_exporter_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse configuration from YAML text without validating it.
    pub fn from_yaml(data: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.conntrack.binary.is_empty() {
            bail!("conntrack.binary is required");
        }

        if self.conntrack.network.is_empty() {
            bail!("conntrack.network is required");
        }

        if self.conntrack.mask.is_empty() {
            bail!("conntrack.mask is required");
        }

        if !self.conntrack.continuous && self.conntrack.polling_time.is_zero() {
            bail!("conntrack.polling_time must be positive unless conntrack.continuous is set");
        }

        if self.conntrack.netlink_buffer_size == 0 {
            bail!("conntrack.netlink_buffer_size must be positive");
        }

        if self.flows.capacity == 0 {
            bail!("flows.capacity must be positive");
        }

        if self.stats.period.is_zero() {
            bail!("stats.period must be positive");
        }

        if self.exporter.addr.is_empty() {
            bail!("exporter.addr is required");
        }

        Ok(())
    }
}
