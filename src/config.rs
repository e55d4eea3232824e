use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::synthetic::SyntheticSet;
use crate::encode::EncodingKind;
use crate::source::filter::EventFilter;

/// Top-level configuration for the perfcollector pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this producer instance to the collector.
    #[serde(default = "default_producer_id")]
    pub producer_id: String,

    /// Aggregation window configuration.
    #[serde(default)]
    pub window: WindowConfig,

    /// Event intake configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Local snapshot retention and spill configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Remote collector upload configuration.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Prometheus and viewer query API server configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Per-metric budgets keyed by metric name, in sample units.
    #[serde(default)]
    pub budgets: HashMap<String, f64>,

    /// Metrics derived per window from other events.
    #[serde(default)]
    pub synthetic: Vec<SyntheticConfig>,
}

/// Aggregation window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Window length. Windows are aligned to multiples of this since the epoch. Default: 1s.
    #[serde(default = "default_window_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// How long a window stays open after its end for late events. Default: 250ms.
    #[serde(default = "default_allowed_lateness", with = "humantime_serde")]
    pub allowed_lateness: Duration,

    /// Distinct metric keys per window before folding into the overflow key. Default: 1024.
    #[serde(default = "default_max_metrics")]
    pub max_metrics: usize,
}

/// Event intake configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Bounded queue between producers and the aggregator. Default: 65536.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-thread begin/end scope nesting limit. Default: 64.
    #[serde(default = "default_max_scope_depth")]
    pub max_scope_depth: usize,

    /// Event allowlist applied at ingest.
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Name/category allowlist. Empty lists accept everything.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FilterConfig {
    /// Name rules, any of which may match.
    #[serde(default)]
    pub names: Vec<NameRule>,

    /// Accepted categories.
    #[serde(default)]
    pub categories: Vec<String>,
}

/// A single event name matching rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameRule {
    Equal(String),
    StartsWith(String),
    Regex(String),
}

/// A metric computed per window from the events of other metrics.
#[derive(Debug, Clone, Deserialize)]
pub struct SyntheticConfig {
    /// Name of the derived metric.
    pub name: String,

    /// Category of the derived metric. Default: "synthetic".
    #[serde(default = "default_synthetic_category")]
    pub category: String,

    /// How the value is computed.
    pub kind: SyntheticKind,
}

/// Derived metric calculators.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticKind {
    /// Sum of matching `increment` samples minus matching `decrement` samples.
    Accumulation {
        #[serde(default)]
        increment: Option<FilterConfig>,
        #[serde(default)]
        decrement: Option<FilterConfig>,
    },
    /// Largest per-instance total. The instance id is capture group 1 of
    /// `instance_id` applied to the event name.
    Instance {
        #[serde(default)]
        filter: FilterConfig,
        instance_id: String,
    },
    /// Peak of `of`, held until `fade_out` of event time passes without a
    /// higher value.
    Highest {
        #[serde(with = "humantime_serde")]
        fade_out: Duration,
        of: Box<SyntheticKind>,
    },
}

/// Local snapshot retention and spill configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Number of sealed windows kept in memory. Default: 300.
    #[serde(default = "default_store_capacity")]
    pub capacity: usize,

    /// Directory for one-file-per-window durable spill. Disabled when unset.
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,

    /// Spill files retained before the oldest are pruned. Default: 3600.
    #[serde(default = "default_spill_max_files")]
    pub spill_max_files: usize,

    /// Reload the newest spilled windows into memory on start. Default: true.
    #[serde(default = "default_true")]
    pub restore_on_start: bool,
}

/// Remote collector upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Enable uploads. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Collector endpoint receiving POSTed batches.
    #[serde(default)]
    pub address: String,

    /// Bearer token sent in the Authorization header.
    #[serde(default)]
    pub token: Option<String>,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Wire form of each window (binary, text). Default: binary.
    #[serde(default)]
    pub encoding: EncodingKind,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Encoded windows per request. Default: 8.
    #[serde(default = "default_upload_batch_size")]
    pub batch_size: usize,

    /// Maximum wait before a partial request is queued. Default: 5s.
    #[serde(default = "default_upload_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Deadline for a single request attempt. Default: 10s.
    #[serde(default = "default_upload_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Pending requests kept before the oldest are dropped. Default: 256.
    #[serde(default = "default_upload_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Concurrent in-flight requests. Default: 1.
    #[serde(default = "default_upload_workers")]
    pub workers: usize,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Retry and backoff policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Budget for the best-effort final upload on shutdown. Default: 2s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Retry and backoff policy for failed uploads.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first failed attempt before a request is dropped. Default: 5.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry. Default: 500ms.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound on any single delay. Default: 30s.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential growth factor per retry. Default: 2.0.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter as a fraction of the delay, spread symmetrically. Default: 0.2.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

/// Prometheus and viewer query API server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the API. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_api_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_producer_id() -> String {
    "perfcollector".to_string()
}

fn default_window_duration() -> Duration {
    Duration::from_secs(1)
}

fn default_allowed_lateness() -> Duration {
    Duration::from_millis(250)
}

fn default_max_metrics() -> usize {
    1024
}

fn default_queue_capacity() -> usize {
    65536
}

fn default_max_scope_depth() -> usize {
    64
}

fn default_synthetic_category() -> String {
    "synthetic".to_string()
}

fn default_store_capacity() -> usize {
    300
}

fn default_spill_max_files() -> usize {
    3600
}

fn default_true() -> bool {
    true
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_upload_batch_size() -> usize {
    8
}

fn default_upload_batch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_upload_max_queue_depth() -> usize {
    256
}

fn default_upload_workers() -> usize {
    1
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_api_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            producer_id: default_producer_id(),
            window: WindowConfig::default(),
            source: SourceConfig::default(),
            store: StoreConfig::default(),
            upload: UploadConfig::default(),
            api: ApiConfig::default(),
            budgets: HashMap::new(),
            synthetic: Vec::new(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration: default_window_duration(),
            allowed_lateness: default_allowed_lateness(),
            max_metrics: default_max_metrics(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_scope_depth: default_max_scope_depth(),
            filter: FilterConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_store_capacity(),
            spill_dir: None,
            spill_max_files: default_spill_max_files(),
            restore_on_start: true,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            token: None,
            headers: HashMap::new(),
            encoding: EncodingKind::default(),
            compression: default_compression(),
            batch_size: default_upload_batch_size(),
            batch_timeout: default_upload_batch_timeout(),
            timeout: default_upload_timeout(),
            max_queue_depth: default_upload_max_queue_depth(),
            workers: default_upload_workers(),
            keep_alive: true,
            retry: RetryConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_api_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.producer_id.is_empty() {
            bail!("producer_id is required");
        }

        if self.window.duration.is_zero() {
            bail!("window.duration must be positive");
        }

        if u64::try_from(self.window.duration.as_nanos()).is_err() {
            bail!("window.duration is too large");
        }

        if self.window.allowed_lateness > self.window.duration {
            bail!("window.allowed_lateness must not exceed window.duration");
        }

        if self.window.max_metrics == 0 {
            bail!("window.max_metrics must be positive");
        }

        if self.source.queue_capacity == 0 {
            bail!("source.queue_capacity must be positive");
        }

        if self.source.max_scope_depth == 0 {
            bail!("source.max_scope_depth must be positive");
        }

        EventFilter::from_config(&self.source.filter).context("source.filter")?;

        if self.store.capacity == 0 {
            bail!("store.capacity must be positive");
        }

        if self.store.spill_dir.is_some() && self.store.spill_max_files == 0 {
            bail!("store.spill_max_files must be positive when spill_dir is set");
        }

        if self.upload.enabled {
            if self.upload.address.is_empty() {
                bail!("upload address is required when enabled");
            }
            if self.upload.batch_size == 0 {
                bail!("upload batch_size must be positive when enabled");
            }
            if self.upload.workers == 0 {
                bail!("upload workers must be positive when enabled");
            }
            if self.upload.max_queue_depth == 0 {
                bail!("upload max_queue_depth must be positive when enabled");
            }
            if self.upload.timeout.is_zero() {
                bail!("upload timeout must be positive when enabled");
            }

            let compression = self.upload.compression.as_str();
            match compression {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" | "" => {}
                _ => bail!("invalid compression type: {compression}"),
            }

            let retry = &self.upload.retry;
            if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
                bail!("upload.retry.multiplier must be >= 1");
            }
            if !(0.0..=1.0).contains(&retry.jitter_factor) {
                bail!("upload.retry.jitter_factor must be within [0, 1]");
            }
            if retry.initial_delay > retry.max_delay {
                bail!("upload.retry.initial_delay must not exceed max_delay");
            }
        }

        for (name, budget) in &self.budgets {
            if !budget.is_finite() || *budget <= 0.0 {
                bail!("budget for {name} must be a positive number");
            }
        }

        let mut synthetic_names = std::collections::HashSet::new();
        for synthetic in &self.synthetic {
            if synthetic.name.is_empty() {
                bail!("synthetic metric name is required");
            }
            if !synthetic_names.insert((&synthetic.name, &synthetic.category)) {
                bail!("duplicate synthetic metric {}", synthetic.name);
            }
        }
        SyntheticSet::from_config(&self.synthetic).context("synthetic")?;

        Ok(())
    }

    /// Window length in nanoseconds.
    pub fn window_ns(&self) -> u64 {
        u64::try_from(self.window.duration.as_nanos()).unwrap_or(u64::MAX)
    }
}
