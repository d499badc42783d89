//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{DeviceId, DeviceType, TriggerId};
use crate::services::engine::RetryPolicy;
use crate::services::occupancy::RollupSettings;
use crate::services::tally_tracker::TallyWindows;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Site identifier used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "facility".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    /// Occupancy buckets per hour; must divide 3600
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    /// How long after the hour ends late digests are still accepted
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Minimum completed-session dwell to count a person as active
    #[serde(default = "default_active_dwell_secs")]
    pub active_dwell_secs: i64,
    #[serde(default = "default_confidence_min")]
    pub age_confidence_min: f32,
    #[serde(default = "default_confidence_min")]
    pub gender_confidence_min: f32,
}

fn default_bucket_count() -> usize {
    60
}

fn default_grace_period_secs() -> u64 {
    900
}

fn default_active_dwell_secs() -> i64 {
    5
}

fn default_confidence_min() -> f32 {
    0.5
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            bucket_count: default_bucket_count(),
            grace_period_secs: default_grace_period_secs(),
            active_dwell_secs: default_active_dwell_secs(),
            age_confidence_min: default_confidence_min(),
            gender_confidence_min: default_confidence_min(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TallyConfig {
    #[serde(default = "default_short_window_secs")]
    pub short_window_secs: i64,
    #[serde(default = "default_long_window_secs")]
    pub long_window_secs: i64,
    /// Retained raw-event horizon
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,
}

fn default_short_window_secs() -> i64 {
    15 * 60
}

fn default_long_window_secs() -> i64 {
    60 * 60
}

fn default_retention_secs() -> i64 {
    24 * 60 * 60
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            short_window_secs: default_short_window_secs(),
            long_window_secs: default_long_window_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    20
}

fn default_backoff_max_ms() -> u64 {
    500
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Whole-digest retries after a recoverable failure
    #[serde(default = "default_digest_retry_limit")]
    pub digest_retry_limit: u32,
    /// JSONL file of device digests to replay
    #[serde(default = "default_input_file")]
    pub input_file: String,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_digest_retry_limit() -> u32 {
    3
}

fn default_input_file() -> String {
    "digests.jsonl".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            digest_retry_limit: default_digest_retry_limit(),
            input_file: default_input_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for sealed rollups and facility reports (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "rollups.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9100
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default)]
    pub borders: Vec<String>,
    #[serde(default)]
    pub hotspots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FacilityConfig {
    pub id: String,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
    #[serde(default)]
    pub tally: TallyConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub facilities: Vec<FacilityConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    bucket_count: usize,
    grace_period_secs: u64,
    active_dwell_secs: i64,
    age_confidence_min: f32,
    gender_confidence_min: f32,
    tally_short_window_secs: i64,
    tally_long_window_secs: i64,
    tally_retention_secs: i64,
    store_max_attempts: u32,
    store_backoff_base_ms: u64,
    store_backoff_max_ms: u64,
    ingest_workers: usize,
    ingest_queue_capacity: usize,
    digest_retry_limit: u32,
    input_file: String,
    egress_file: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    facilities: Vec<FacilityConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(
            TomlConfig {
                site: SiteConfig::default(),
                rollup: RollupConfig::default(),
                tally: TallyConfig::default(),
                store: StoreConfig::default(),
                ingest: IngestConfig::default(),
                egress: EgressConfig::default(),
                metrics: MetricsConfig::default(),
                facilities: Vec::new(),
            },
            "default".to_string(),
        )
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            bucket_count: toml_config.rollup.bucket_count,
            grace_period_secs: toml_config.rollup.grace_period_secs,
            active_dwell_secs: toml_config.rollup.active_dwell_secs,
            age_confidence_min: toml_config.rollup.age_confidence_min,
            gender_confidence_min: toml_config.rollup.gender_confidence_min,
            tally_short_window_secs: toml_config.tally.short_window_secs,
            tally_long_window_secs: toml_config.tally.long_window_secs,
            tally_retention_secs: toml_config.tally.retention_secs,
            store_max_attempts: toml_config.store.max_attempts,
            store_backoff_base_ms: toml_config.store.backoff_base_ms,
            store_backoff_max_ms: toml_config.store.backoff_max_ms,
            ingest_workers: toml_config.ingest.workers,
            ingest_queue_capacity: toml_config.ingest.queue_capacity,
            digest_retry_limit: toml_config.ingest.digest_retry_limit,
            input_file: toml_config.ingest.input_file,
            egress_file: toml_config.egress.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            facilities: toml_config.facilities,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .rollup_settings()
            .with_context(|| format!("Invalid [rollup] section in {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load a specific file, falling back to defaults with a warning
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Builder-facing settings; fails on a bucket count that does not divide the hour
    pub fn rollup_settings(&self) -> anyhow::Result<RollupSettings> {
        Ok(RollupSettings::new(
            self.bucket_count,
            self.active_dwell_secs,
            self.age_confidence_min,
            self.gender_confidence_min,
        )?)
    }

    pub fn tally_windows(&self) -> TallyWindows {
        TallyWindows::from_secs(
            self.tally_short_window_secs,
            self.tally_long_window_secs,
            self.tally_retention_secs,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.store_max_attempts.max(1),
            backoff_base: Duration::from_millis(self.store_backoff_base_ms),
            backoff_max: Duration::from_millis(self.store_backoff_max_ms),
        }
    }

    /// Flattened (facility, device, type, borders, hotspots) view for the registry
    pub fn registered_devices(
        &self,
    ) -> impl Iterator<Item = (&str, DeviceId, DeviceType, Vec<TriggerId>, Vec<TriggerId>)> {
        self.facilities.iter().flat_map(|facility| {
            facility.devices.iter().map(move |device| {
                (
                    facility.id.as_str(),
                    DeviceId::new(device.id.clone()),
                    device.device_type,
                    device.borders.iter().cloned().map(TriggerId::new).collect(),
                    device.hotspots.iter().cloned().map(TriggerId::new).collect(),
                )
            })
        })
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn grace_period_secs(&self) -> u64 {
        self.grace_period_secs
    }

    pub fn active_dwell_secs(&self) -> i64 {
        self.active_dwell_secs
    }

    pub fn ingest_workers(&self) -> usize {
        self.ingest_workers.max(1)
    }

    pub fn ingest_queue_capacity(&self) -> usize {
        self.ingest_queue_capacity.max(1)
    }

    pub fn digest_retry_limit(&self) -> u32 {
        self.digest_retry_limit
    }

    pub fn input_file(&self) -> &str {
        &self.input_file
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn facilities(&self) -> &[FacilityConfig] {
        &self.facilities
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests and tools to swap the bucket count
    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    /// Builder method for tests and tools to register facilities
    pub fn with_facilities(mut self, facilities: Vec<FacilityConfig>) -> Self {
        self.facilities = facilities;
        self
    }
}
