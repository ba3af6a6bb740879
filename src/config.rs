use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docflow_core::facets::{FacetDef, StaticFacetSchemas};
use docflow_core::models::Phase;

/// Lower bound applied to `queue.stale_ms`.
pub const MIN_STALE_MS: i64 = 10_000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub libraries: BTreeMap<String, LibraryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_stale_ms")]
    pub stale_ms: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stale_ms: default_stale_ms(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl QueueConfig {
    /// `stale_ms` clamped to [`MIN_STALE_MS`].
    pub fn effective_stale_ms(&self) -> i64 {
        self.stale_ms.max(MIN_STALE_MS)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn default_stale_ms() -> i64 {
    60_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_true")]
    pub legacy_fallback: bool,
    #[serde(default = "default_phases")]
    pub phases: Vec<Phase>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_language: default_target_language(),
            template: default_template(),
            legacy_fallback: true,
            phases: default_phases(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_target_language() -> String {
    "de".to_string()
}
fn default_template() -> String {
    "default".to_string()
}
fn default_true() -> bool {
    true
}
fn default_phases() -> Vec<Phase> {
    Phase::ALL.to_vec()
}
fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./library")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// `{id}` is replaced with the job id.
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            url: None,
            timeout_secs: default_timeout_secs(),
            callback_url: None,
        }
    }
}

fn default_provider_kind() -> String {
    "local".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LibraryConfig {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub facets: Vec<FacetDef>,
}

impl Config {
    /// Facet schemas declared under `[libraries.*]`.
    pub fn facet_schemas(&self) -> StaticFacetSchemas {
        let mut schemas = StaticFacetSchemas::new();
        for (id, lib) in &self.libraries {
            schemas.insert(id, lib.owner.clone(), lib.facets.clone());
        }
        schemas
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.queue.stale_ms < MIN_STALE_MS {
        tracing::warn!(
            configured = config.queue.stale_ms,
            floor = MIN_STALE_MS,
            "queue.stale_ms below minimum, clamping"
        );
        config.queue.stale_ms = MIN_STALE_MS;
    }

    if config.queue.max_attempts == 0 {
        anyhow::bail!("queue.max_attempts must be >= 1");
    }

    if config.queue.heartbeat_interval_ms as i64 >= config.queue.effective_stale_ms() {
        anyhow::bail!(
            "queue.heartbeat_interval_ms ({}) must be < queue.stale_ms ({})",
            config.queue.heartbeat_interval_ms,
            config.queue.effective_stale_ms()
        );
    }

    if config.pipeline.phases.is_empty() {
        anyhow::bail!("pipeline.phases must name at least one phase");
    }
    if config.pipeline.phases.windows(2).any(|w| w[0] >= w[1]) {
        anyhow::bail!("pipeline.phases must keep the order extract, transform, ingest without repeats");
    }

    if config.pipeline.target_language.trim().is_empty() {
        anyhow::bail!("pipeline.target_language must not be empty");
    }
    if config.pipeline.max_tokens == 0 {
        anyhow::bail!("pipeline.max_tokens must be > 0");
    }

    match config.provider.kind.as_str() {
        "local" => {}
        "http" => {
            if config.provider.url.is_none() {
                anyhow::bail!("provider.url must be specified when provider.kind is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown provider kind: '{}'. Must be local or http.",
            other
        ),
    }

    Ok(config)
}
