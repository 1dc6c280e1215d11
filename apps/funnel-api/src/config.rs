//! API server configuration.
//!
//! Loaded with the `config` crate: built-in defaults, then an optional TOML
//! file, then `FUNNEL_API__*` environment variables (`__` separates nested
//! keys, e.g. `FUNNEL_API__TENANTS__ACME__ACCESS_TOKEN`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use funnel_sync::{CrmCredentials, StaticCredentialResolver};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "funnel-api.toml";

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "FUNNEL_API";

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Socket address the HTTP server listens on.
    pub bind_addr: String,

    /// SQLite lead store.
    pub database_path: PathBuf,

    /// Sync engine TOML; the platform config dir is used when unset.
    pub sync_config_path: Option<PathBuf>,

    /// Serve every tenant from the built-in demo CRM instead of Kommo.
    pub demo: bool,

    /// Tenant id to CRM account.
    pub tenants: HashMap<String, CrmCredentials>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            bind_addr: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("funnel.db"),
            sync_config_path: None,
            demo: false,
            tenants: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path` (optional file) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue(format!(
                "bind_addr '{}' is not a socket address",
                self.bind_addr
            )));
        }

        for (tenant_id, creds) in &self.tenants {
            if creds.access_token.trim().is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "tenant '{tenant_id}' has an empty access_token"
                )));
            }
        }

        Ok(())
    }

    /// Credential table for the sync engine.
    ///
    /// In demo mode every configured tenant points at the demo CRM, and a
    /// `demo` tenant is always present.
    pub fn resolver(&self, demo_base_url: &str) -> StaticCredentialResolver {
        let mut resolver: StaticCredentialResolver = self
            .tenants
            .iter()
            .map(|(tenant_id, creds)| {
                let base_url = if self.demo {
                    demo_base_url
                } else {
                    creds.base_url.as_str()
                };
                (
                    tenant_id.clone(),
                    CrmCredentials::new(base_url, creds.access_token.clone()),
                )
            })
            .collect();

        if self.demo {
            resolver = resolver.with_tenant("demo", CrmCredentials::new(demo_base_url, "demo"));
        }

        resolver
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
}
