//! Configuration loading and root folder resolution
//!
//! The service reads one TOML file (`nsi-ai.toml` in the root folder). Every section and
//! every key is optional; missing values fall back to the defaults below.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the service configuration inside the root folder
pub const CONFIG_FILE_NAME: &str = "nsi-ai.toml";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "nsi.db";

/// Complete TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder override (only honoured from the user-level config file)
    pub root_folder: Option<PathBuf>,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineSettings,
    pub gateway: GatewaySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub batch: BatchSettings,
    pub similarity: SimilaritySettings,
    pub cache: CacheSettings,
    pub providers: Vec<ProviderSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5730".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing directive when RUST_LOG is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Classification pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Concurrent workers pulling records (kept small to respect provider limits)
    pub workers: usize,
    /// Records per checkpointed batch
    pub checkpoint_batch_size: usize,
    /// Minimum fuzzy-name similarity to accept a reference entry
    pub reference_name_threshold: f64,
    /// Minimum similarity to accept a benchmark match
    pub benchmark_threshold: f64,
    /// AI answers below this confidence are kept but flagged for review
    pub ai_min_confidence: f64,
    /// Any result below this confidence is flagged for review
    pub manual_review_threshold: f64,
    /// Confidence given to a parent reference code standing in for a weak leaf match
    pub parent_code_confidence: f64,
    /// Rate-limited records are requeued at most this many times
    pub max_requeues: u32,
    /// Exhausted providers send the record to manual review instead of failing the job
    pub fallback_to_manual_review: bool,
    /// Resume jobs left `active` by a crash when the service starts
    pub resume_on_startup: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            checkpoint_batch_size: 50,
            reference_name_threshold: 0.85,
            benchmark_threshold: 0.90,
            ai_min_confidence: 0.70,
            manual_review_threshold: 0.50,
            parent_code_confidence: 0.55,
            max_requeues: 3,
            fallback_to_manual_review: true,
            resume_on_startup: true,
        }
    }
}

/// How answers from several providers are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Providers are tried one at a time in ranking order; the first answer wins
    #[default]
    FirstSuccess,
    /// Every available provider answers; the most common (code, name) wins
    MajorityVote,
    /// Every available provider answers; the most confident answer wins
    HighestConfidence,
    /// Every available provider answers; the best-ranked answer wins and the rest are kept
    AllResults,
}

impl AggregationStrategy {
    /// True when one call fans out to every available provider
    pub fn fans_out(&self) -> bool {
        !matches!(self, AggregationStrategy::FirstSuccess)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    /// Provider attempts per classification (first try included)
    pub max_retries: usize,
    /// Per-call deadline; expiry counts as a provider failure
    pub call_timeout_ms: u64,
    /// Longest wait for a rate-limit token
    pub rate_limit_wait_ms: u64,
    /// Smoothing factor for the latency average
    pub latency_ewma_alpha: f64,
    /// Sample requests per provider in a benchmark run
    pub sample_requests: usize,
    pub aggregation_strategy: AggregationStrategy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            call_timeout_ms: 15_000,
            rate_limit_wait_ms: 2_000,
            latency_ewma_alpha: 0.3,
            sample_requests: 3,
            aggregation_strategy: AggregationStrategy::FirstSuccess,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub max_wait_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimilaritySettings {
    /// Pairs scoring at or above this are grouped as duplicates
    pub duplicate_threshold: f64,
    /// Below this token overlap the edit-distance score is consulted
    pub token_fallback_threshold: f64,
}

impl Default for SimilaritySettings {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.85,
            token_fallback_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    pub reference_ttl_secs: u64,
    pub ai_answer_ttl_secs: u64,
    pub report_ttl_secs: u64,
    pub ai_answer_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            reference_ttl_secs: 3600,
            ai_answer_ttl_secs: 600,
            report_ttl_secs: 30,
            ai_answer_capacity: 10_000,
        }
    }
}

/// One AI provider entry (`[[providers]]`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub name: String,
    /// Base URL of an OpenAI-compatible API (".../v1")
    pub base_url: String,
    pub model: String,
    /// Lowest-priority key source; database and environment win
    pub api_key: Option<String>,
    pub enabled: bool,
    /// Configured order, used until live measurements exist (lower first)
    pub priority: u32,
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: String::new(),
            model: String::new(),
            api_key: None,
            enabled: true,
            priority: 100,
            requests_per_minute: 60,
            burst: 5,
        }
    }
}

impl TomlConfig {
    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.workers == 0 {
            return Err(Error::Config("pipeline.workers must be at least 1".to_string()));
        }
        if p.checkpoint_batch_size == 0 {
            return Err(Error::Config(
                "pipeline.checkpoint_batch_size must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("pipeline.reference_name_threshold", p.reference_name_threshold),
            ("pipeline.benchmark_threshold", p.benchmark_threshold),
            ("pipeline.ai_min_confidence", p.ai_min_confidence),
            ("pipeline.manual_review_threshold", p.manual_review_threshold),
            ("pipeline.parent_code_confidence", p.parent_code_confidence),
            ("similarity.duplicate_threshold", self.similarity.duplicate_threshold),
            ("similarity.token_fallback_threshold", self.similarity.token_fallback_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        if !(0.0 < self.gateway.latency_ewma_alpha && self.gateway.latency_ewma_alpha <= 1.0) {
            return Err(Error::Config("gateway.latency_ewma_alpha must be within (0, 1]".to_string()));
        }
        if self.gateway.max_retries == 0 {
            return Err(Error::Config("gateway.max_retries must be at least 1".to_string()));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.half_open_max_calls == 0 {
            return Err(Error::Config(
                "circuit_breaker thresholds must be at least 1".to_string(),
            ));
        }
        if self.batch.max_batch_size == 0 {
            return Err(Error::Config("batch.max_batch_size must be at least 1".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(Error::Config("providers[].name must not be empty".to_string()));
            }
            if !seen.insert(provider.name.to_lowercase()) {
                return Err(Error::Config(format!("duplicate provider name: {}", provider.name)));
            }
            if provider.requests_per_minute == 0 || provider.burst == 0 {
                return Err(Error::Config(format!(
                    "provider {}: requests_per_minute and burst must be at least 1",
                    provider.name
                )));
            }
        }
        Ok(())
    }

    /// Providers that take part in classification
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderSettings> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// Root folder resolution, priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. User/system TOML config file (`root_folder` key)
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&Path>, env_var_name: &str) -> PathBuf {
    if let Some(path) = cli_arg {
        debug!("Root folder from command line: {}", path.display());
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            debug!("Root folder from {}: {}", env_var_name, path);
            return PathBuf::from(path);
        }
    }

    if let Some(root) = locate_user_config()
        .and_then(|path| load_toml_config(&path).ok())
        .and_then(|config| config.root_folder)
    {
        debug!("Root folder from user config: {}", root.display());
        return root;
    }

    default_root_folder()
}

/// User-level config file (`~/.config/nsi/config.toml`, then `/etc/nsi/config.toml` on Linux)
fn locate_user_config() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("nsi").join("config.toml"));
    if let Some(path) = user_config.filter(|p| p.exists()) {
        return Some(path);
    }
    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/nsi/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }
    None
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("nsi"))
        .unwrap_or_else(|| PathBuf::from("./nsi_data"))
}

/// Load a TOML config file; a missing file yields the defaults
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        info!("No config file at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Write config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;

    // Provider API keys may live in this file
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(TomlConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [pipeline]
            workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.checkpoint_batch_size, 50);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let mut config = TomlConfig::default();
        config.pipeline.benchmark_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_provider_names() {
        let mut config = TomlConfig::default();
        let provider = ProviderSettings {
            name: "OpenRouter".to_string(),
            ..Default::default()
        };
        config.providers = vec![provider.clone(), ProviderSettings { name: "openrouter".to_string(), ..provider }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_aggregation_strategy_from_toml() {
        let config: TomlConfig = toml::from_str(
            r#"
            [gateway]
            aggregation_strategy = "majority_vote"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.aggregation_strategy, AggregationStrategy::MajorityVote);
        assert!(config.gateway.aggregation_strategy.fans_out());
        assert_eq!(
            TomlConfig::default().gateway.aggregation_strategy,
            AggregationStrategy::FirstSuccess
        );
        assert!(toml::from_str::<TomlConfig>("[gateway]\naggregation_strategy = \"loudest\"").is_err());
    }

    #[test]
    fn test_cli_arg_wins() {
        let resolved = resolve_root_folder(Some(Path::new("/tmp/nsi-cli")), "NSI_TEST_UNSET_VAR_XYZ");
        assert_eq!(resolved, PathBuf::from("/tmp/nsi-cli"));
    }
}
