//! Configuration loading and validation

use anyhow::{bail, Context, Result};
use meterline_core::{CounterSpec, Format, OutputSpec, PathRules, TypeTables};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub paths: PathRules,
    #[serde(default, rename = "counter")]
    pub counters: Vec<CounterSpec>,
    #[serde(default, rename = "output")]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub rules: RulesConfig,
    /// Enumeration tables referenced as `types.NAME[<..>]`
    #[serde(default)]
    pub types: TypeTables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How long running tasks get to finish after a shutdown signal
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_grace(),
        }
    }
}

impl DaemonConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_grace() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// Database URL
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Delay between attempts while waiting for the store or for nodes
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            url: default_store_url(),
            max_connections: default_max_connections(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl StoreConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

fn default_store_url() -> String {
    "postgres://postgres@localhost:5432/meterline".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_retry_delay() -> u64 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// File path or http(s) URL of the probe document
    #[serde(default = "default_probe_source")]
    pub source: String,
    #[serde(default)]
    pub format: Format,
    /// Re-fetch interval in seconds (0 to ingest once)
    #[serde(default)]
    pub refresh_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            source: default_probe_source(),
            format: Format::default(),
            refresh_secs: 0,
        }
    }
}

fn default_probe_source() -> String {
    "http://localhost:5000/probe".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Evaluation interval in seconds
    #[serde(default = "default_rules_interval")]
    pub interval_secs: u64,
    /// Device keys substituted for `${deviceId}`
    #[serde(default)]
    pub devices: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rules_interval(),
            devices: Vec::new(),
        }
    }
}

fn default_rules_interval() -> u64 {
    1
}

impl Config {
    /// Reject settings that would make a task spin or never resolve
    pub fn validate(&self) -> Result<()> {
        if self.store.kind == StoreKind::Postgres && self.store.url.is_empty() {
            bail!("store.url is required for the postgres store");
        }
        if self.probe.source.is_empty() {
            bail!("probe.source is required");
        }
        for counter in &self.counters {
            if counter.device.is_empty() || counter.delta.is_empty() || counter.lifetime.is_empty() {
                bail!("counter entries need device, delta, and lifetime paths");
            }
        }
        for output in &self.outputs {
            if output.key.is_empty() {
                bail!("output entries need a key");
            }
        }
        if !self.outputs.is_empty() && self.rules.interval_secs == 0 {
            bail!("rules.interval_secs must be positive");
        }
        Ok(())
    }
}

/// Load configuration from file, or use defaults
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };
    config.validate()?;
    Ok(config)
}
