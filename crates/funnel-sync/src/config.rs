//! # Sync Configuration
//!
//! Configuration management for the CRM client and sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FUNNEL_SYNC_MODE=incremental                                       │
//! │     FUNNEL_MIN_INTERVAL_MS=250                                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/funnel/sync.toml (Linux)                                 │
//! │     ~/Library/Application Support/io.funnel.funnel/sync.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     200 ms pacing, 3 retries, 250 leads per page, ...                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [client]
//! min_interval_ms = 200
//! max_retries = 3
//! base_backoff_ms = 1000
//! page_size = 250
//!
//! [store]
//! batch_size = 50
//!
//! [sync]
//! default_mode = "incremental"
//! incremental_overlap_secs = 300
//!
//! [classifier]
//! won = ["vendido"]
//! lost = [{ token = "cancelled" }]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use funnel_core::{KeywordRule, KeywordRules, MAX_PAGE_LIMIT};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Mode
// =============================================================================

/// How much of the CRM a sync pulls.
///
/// ## Mode Behavior
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                        Sync Mode Behavior                               │
/// │                                                                         │
/// │  FULL                                                                  │
/// │  ────                                                                  │
/// │  • Lists every lead of the tenant                                      │
/// │  • If the listing completed, leads missing from it are soft-deleted    │
/// │  • Slow on big accounts                                                │
/// │                                                                         │
/// │  INCREMENTAL (Default)                                                 │
/// │  ─────────────────────                                                 │
/// │  • Lists leads updated since last_synced_at - overlap                  │
/// │  • Never soft-deletes                                                  │
/// │  • Escalates to FULL when the tenant was never synced                  │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,

    #[default]
    Incremental,
}

impl SyncMode {
    pub fn is_full(&self) -> bool {
        matches!(self, SyncMode::Full)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" | "delta" => Ok(SyncMode::Incremental),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown sync mode: '{}'. Valid options: full, incremental",
                other
            ))),
        }
    }
}

// =============================================================================
// Client Settings
// =============================================================================

/// CRM client behavior: pacing, retries, paging and enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Minimum gap between the start of two outbound calls (milliseconds).
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,

    /// Retries after the first attempt for 429, 5xx and network failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay (milliseconds). Doubles on every retry.
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    /// Upper bound for a single retry delay (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Leads requested per listing page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Concurrent by-id fetches per enrichment batch.
    #[serde(default = "default_enrich_concurrency")]
    pub enrich_concurrency: usize,

    /// Pause between enrichment batches (milliseconds).
    #[serde(default = "default_enrich_delay")]
    pub enrich_delay_ms: u64,

    /// How long resolved credentials stay cached (seconds).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Whole-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_min_interval() -> u64 {
    200
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_page_size() -> u32 {
    MAX_PAGE_LIMIT
}
fn default_enrich_concurrency() -> usize {
    3
}
fn default_enrich_delay() -> u64 {
    500
}
fn default_token_ttl() -> u64 {
    24 * 60 * 60
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            min_interval_ms: default_min_interval(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
            page_size: default_page_size(),
            enrich_concurrency: default_enrich_concurrency(),
            enrich_delay_ms: default_enrich_delay(),
            token_ttl_secs: default_token_ttl(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ClientSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn enrich_delay(&self) -> Duration {
        Duration::from_millis(self.enrich_delay_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Settings for the production HTTP transport.
    pub fn transport_config(&self) -> crate::transport::TransportConfig {
        crate::transport::TransportConfig {
            request_timeout: self.request_timeout(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Store Settings
// =============================================================================

/// Lead store write behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Leads written per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    funnel_db::DEFAULT_BATCH_SIZE
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            batch_size: default_batch_size(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync scheduling behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Mode used when a caller does not pick one.
    #[serde(default)]
    pub default_mode: SyncMode,

    /// Incremental syncs look back this far before `last_synced_at` (seconds).
    #[serde(default = "default_overlap")]
    pub incremental_overlap_secs: i64,

    /// Re-fetch every listed lead by id before storing it.
    #[serde(default)]
    pub enrich_details: bool,

    /// Capacity of the background job queue.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_overlap() -> i64 {
    300
}
fn default_queue_size() -> usize {
    64
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            default_mode: SyncMode::default(),
            incremental_overlap_secs: default_overlap(),
            enrich_details: false,
            queue_size: default_queue_size(),
        }
    }
}

// =============================================================================
// Classifier Settings
// =============================================================================

/// Extra stage-name keywords appended after the built-in ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierSettings {
    #[serde(default)]
    pub won: Vec<KeywordRule>,

    #[serde(default)]
    pub lost: Vec<KeywordRule>,
}

impl ClassifierSettings {
    /// Built-in rules extended with the configured ones.
    pub fn keyword_rules(&self) -> KeywordRules {
        KeywordRules::default().extend(self.won.clone(), self.lost.clone())
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// CRM client settings.
    #[serde(default)]
    pub client: ClientSettings,

    /// Lead store settings.
    #[serde(default)]
    pub store: StoreSettings,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Stage classifier keywords.
    #[serde(default)]
    pub classifier: ClassifierSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let client = &self.client;

        if client.page_size == 0 || client.page_size > MAX_PAGE_LIMIT {
            return Err(SyncError::InvalidConfig(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }

        if client.enrich_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "enrich_concurrency must be greater than 0".into(),
            ));
        }

        if client.base_backoff_ms > client.max_backoff_ms {
            return Err(SyncError::InvalidConfig(
                "base_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }

        if client.token_ttl_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "token_ttl_secs must be greater than 0".into(),
            ));
        }

        if self.store.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.incremental_overlap_secs < 0 {
            return Err(SyncError::InvalidConfig(
                "incremental_overlap_secs must not be negative".into(),
            ));
        }

        if self.sync.queue_size == 0 {
            return Err(SyncError::InvalidConfig(
                "queue_size must be greater than 0".into(),
            ));
        }

        self.classifier
            .keyword_rules()
            .validate()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("FUNNEL_SYNC_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding sync mode from environment");
                    self.sync.default_mode = parsed;
                }
                Err(_) => warn!(mode = %mode, "Unknown sync mode in environment"),
            }
        }

        if let Some(ms) = env_parse("FUNNEL_MIN_INTERVAL_MS") {
            self.client.min_interval_ms = ms;
        }

        if let Some(retries) = env_parse("FUNNEL_MAX_RETRIES") {
            self.client.max_retries = retries;
        }

        if let Some(ms) = env_parse("FUNNEL_BASE_BACKOFF_MS") {
            self.client.base_backoff_ms = ms;
        }

        if let Some(size) = env_parse("FUNNEL_PAGE_SIZE") {
            self.client.page_size = size;
        }

        if let Some(size) = env_parse("FUNNEL_BATCH_SIZE") {
            self.store.batch_size = size;
        }

        if let Some(secs) = env_parse("FUNNEL_INCREMENTAL_OVERLAP_SECS") {
            self.sync.incremental_overlap_secs = secs;
        }

        if let Some(enrich) = env_parse("FUNNEL_ENRICH_DETAILS") {
            self.sync.enrich_details = enrich;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "funnel", "funnel")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn default_mode(&self) -> SyncMode {
        self.sync.default_mode
    }

    /// Incremental look-back window in seconds.
    pub fn overlap_secs(&self) -> i64 {
        self.sync.incremental_overlap_secs
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => {
            debug!(key, value = %raw, "Overriding sync config from environment");
            Some(value)
        }
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!("full".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert_eq!("FULL".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert_eq!(
            "incremental".parse::<SyncMode>().unwrap(),
            SyncMode::Incremental
        );
        assert_eq!("delta".parse::<SyncMode>().unwrap(), SyncMode::Incremental);
        assert!("invalid".parse::<SyncMode>().is_err());
        assert_eq!(SyncMode::Full.to_string(), "full");
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.client.min_interval(), Duration::from_millis(200));
        assert_eq!(config.client.max_retries, 3);
        assert_eq!(config.client.base_backoff(), Duration::from_secs(1));
        assert_eq!(config.client.page_size, 250);
        assert_eq!(config.client.enrich_concurrency, 3);
        assert_eq!(config.client.token_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.store.batch_size, 50);
        assert_eq!(config.overlap_secs(), 300);
        assert_eq!(config.default_mode(), SyncMode::Incremental);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.client.page_size = 0;
        assert!(config.validate().is_err());

        config.client.page_size = 251;
        assert!(config.validate().is_err());

        config.client.page_size = 100;
        config.store.batch_size = 0;
        assert!(config.validate().is_err());

        config.store.batch_size = 10;
        config.classifier.won = vec![KeywordRule::phrase("  ")];
        assert!(config.validate().is_err());

        config.classifier.won = vec![KeywordRule::phrase("vendido")];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_sections() {
        let toml_str = r#"
            [client]
            min_interval_ms = 50

            [sync]
            default_mode = "full"

            [classifier]
            won = ["vendido"]
            lost = [{ token = "cancelled" }]
        "#;

        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.min_interval_ms, 50);
        assert_eq!(config.client.max_retries, 3);
        assert_eq!(config.default_mode(), SyncMode::Full);

        let rules = config.classifier.keyword_rules();
        assert_eq!(
            rules.match_name("Vendido!"),
            Some(funnel_core::StageOutcome::Won)
        );
        assert_eq!(
            rules.match_name("Cancelled by client"),
            Some(funnel_core::StageOutcome::Lost)
        );
    }

    #[test]
    fn test_toml_serialization() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[client]"));
        assert!(toml_str.contains("[sync]"));
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let path = std::env::temp_dir().join(format!("funnel-sync-{}.toml", std::process::id()));
        let mut config = SyncConfig::default();
        config.client.page_size = 100;
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path.clone())).unwrap();
        assert_eq!(loaded.client.page_size, 100);

        std::fs::remove_file(path).ok();
    }
}
