//! # Sync Error Types
//!
//! Error types for CRM access and sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Credentials   │  │     Upstream (CRM)      │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  AuthMissing    │  │  RateLimited            │ │
//! │  │  InvalidUrl     │  │  InvalidInput   │  │  Upstream (non-2xx)     │ │
//! │  │  ConfigLoad/Save│  │  InvalidWebhook │  │  Network / Decode       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │    Database     │  │      Internal                               │  │
//! │  │                 │  │                                             │  │
//! │  │  DatabaseError  │  │  ChannelError / ShuttingDown / Internal     │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid CRM base URL.
    #[error("Invalid CRM URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Credential Errors
    // =========================================================================
    /// No CRM credentials are configured for the tenant.
    #[error("No CRM credentials configured for tenant '{tenant_id}'")]
    AuthMissing { tenant_id: String },

    /// Tenant id or query failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Webhook body could not be parsed.
    #[error("Invalid webhook payload: {0}")]
    InvalidWebhook(String),

    // =========================================================================
    // Upstream Errors
    // =========================================================================
    /// CRM kept answering 429 after every retry.
    #[error("CRM rate limit still exceeded after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// CRM answered with a non-success status.
    #[error("CRM returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The request never produced a response.
    #[error("Network error: {0}")]
    Network(String),

    /// The response body could not be decoded.
    #[error("Failed to decode CRM response: {0}")]
    Decode(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Lead store operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Worker is shutting down.
    #[error("Sync worker is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<funnel_db::DbError> for SyncError {
    fn from(err: funnel_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<funnel_core::ValidationError> for SyncError {
    fn from(err: funnel_core::ValidationError) -> Self {
        SyncError::InvalidInput(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(secs) => {
                SyncError::Network(format!("request timed out after {secs}s"))
            }
            TransportError::Connect(msg) | TransportError::Other(msg) => SyncError::Network(msg),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the request may succeed when repeated.
    ///
    /// ## Retryable Errors
    /// - Network failures (connect, reset, timeout)
    /// - Upstream 5xx responses
    ///
    /// ## Non-Retryable Errors
    /// - Configuration and credential errors
    /// - Upstream 4xx responses
    /// - `RateLimited`, which is only produced once retries are exhausted
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::AuthMissing { .. }
        )
    }

    /// Returns true if the caller sent something unusable.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, SyncError::InvalidInput(_) | SyncError::InvalidWebhook(_))
    }

    /// Returns true if the CRM could not be used (down, refusing, or throttling).
    pub fn is_upstream_error(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. }
                | SyncError::Upstream { .. }
                | SyncError::Network(_)
                | SyncError::Decode(_)
        )
    }
}
