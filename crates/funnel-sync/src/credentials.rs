//! # CRM Credentials
//!
//! Resolves per-tenant CRM credentials and caches them inside one client.
//!
//! ## Resolution Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Credential Resolution                              │
//! │                                                                         │
//! │  ┌────────────────┐     ┌─────────────────┐     ┌─────────────────┐    │
//! │  │  CrmClient     │     │  CredentialCache│     │ CredentialResolver│  │
//! │  │  (one tenant)  │     │  (in client)    │     │ (collaborator)  │    │
//! │  └───────┬────────┘     └────────┬────────┘     └────────┬────────┘    │
//! │          │  1. credentials()     │                       │             │
//! │          │──────────────────────►│                       │             │
//! │          │                       │  2. cached & fresh?   │             │
//! │          │   yes: return copy    │                       │             │
//! │          │◄──────────────────────│                       │             │
//! │          │                       │  3. no: resolve(tenant)│            │
//! │          │                       │──────────────────────►│             │
//! │          │                       │◄──────────────────────│             │
//! │          │                       │  Some(creds) / None   │             │
//! │          │  4. creds or          │                       │             │
//! │          │     AuthMissing       │                       │             │
//! │          │◄──────────────────────│                       │             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Isolation
//! A cache belongs to exactly one tenant's client. Credentials are never
//! shared between tenants, and a missing credential is never cached so a
//! tenant that is configured later starts working without a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Credentials
// =============================================================================

/// Decrypted access to one tenant's CRM account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmCredentials {
    /// Account base URL, e.g. `https://acme.kommo.com`.
    pub base_url: String,

    /// Long-lived bearer token.
    pub access_token: String,
}

impl CrmCredentials {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        CrmCredentials {
            base_url: base_url.into(),
            access_token: access_token.into(),
        }
    }

    /// Joins an API path onto the base URL.
    pub fn url(&self, path: &str) -> SyncResult<String> {
        let base = url::Url::parse(&self.base_url)?;
        Ok(base.join(path)?.to_string())
    }
}

impl std::fmt::Debug for CrmCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmCredentials")
            .field("base_url", &self.base_url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Resolver Trait
// =============================================================================

/// Supplies decrypted credentials for a tenant.
///
/// `Ok(None)` means the tenant has no CRM connection configured; `Err` is
/// reserved for failures of the resolver itself.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, tenant_id: &str) -> SyncResult<Option<CrmCredentials>>;
}

/// Resolver over a fixed tenant table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialResolver {
    tenants: HashMap<String, CrmCredentials>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tenant (builder style).
    pub fn with_tenant(
        mut self,
        tenant_id: impl Into<String>,
        credentials: CrmCredentials,
    ) -> Self {
        self.tenants.insert(tenant_id.into(), credentials);
        self
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

impl FromIterator<(String, CrmCredentials)> for StaticCredentialResolver {
    fn from_iter<I: IntoIterator<Item = (String, CrmCredentials)>>(iter: I) -> Self {
        StaticCredentialResolver {
            tenants: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, tenant_id: &str) -> SyncResult<Option<CrmCredentials>> {
        Ok(self.tenants.get(tenant_id).cloned())
    }
}

// =============================================================================
// Credential Cache
// =============================================================================

/// Cached credentials with a local expiry.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub credentials: CrmCredentials,
    pub expires_at: Instant,
}

impl TokenInfo {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_secs(&self) -> u64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs()
    }
}

/// Per-client credential cache.
#[derive(Clone)]
pub struct CredentialCache {
    tenant_id: String,
    resolver: Arc<dyn CredentialResolver>,
    ttl: Duration,
    token: Arc<RwLock<Option<TokenInfo>>>,
}

impl CredentialCache {
    pub fn new(
        tenant_id: impl Into<String>,
        resolver: Arc<dyn CredentialResolver>,
        ttl: Duration,
    ) -> Self {
        CredentialCache {
            tenant_id: tenant_id.into(),
            resolver,
            ttl,
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns cached credentials, resolving them when absent or expired.
    ///
    /// ## Errors
    /// - `AuthMissing` when the resolver has nothing for this tenant
    pub async fn get(&self) -> SyncResult<CrmCredentials> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if !token.is_expired() {
                    debug!(
                        tenant_id = %self.tenant_id,
                        remaining_secs = token.remaining_secs(),
                        "Using cached CRM credentials"
                    );
                    return Ok(token.credentials.clone());
                }
            }
        }

        let mut guard = self.token.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = guard.as_ref() {
            if !token.is_expired() {
                return Ok(token.credentials.clone());
            }
        }

        let credentials = self
            .resolver
            .resolve(&self.tenant_id)
            .await?
            .ok_or_else(|| SyncError::AuthMissing {
                tenant_id: self.tenant_id.clone(),
            })?;

        info!(
            tenant_id = %self.tenant_id,
            base_url = %credentials.base_url,
            ttl_secs = self.ttl.as_secs(),
            "Resolved CRM credentials"
        );

        *guard = Some(TokenInfo {
            credentials: credentials.clone(),
            expires_at: Instant::now() + self.ttl,
        });

        Ok(credentials)
    }

    /// Drops the cached credentials.
    pub async fn invalidate(&self) {
        *self.token.write().await = None;
    }

    pub async fn is_cached(&self) -> bool {
        self.token
            .read()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        inner: StaticCredentialResolver,
    }

    #[async_trait]
    impl CredentialResolver for CountingResolver {
        async fn resolve(&self, tenant_id: &str) -> SyncResult<Option<CrmCredentials>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(tenant_id).await
        }
    }

    fn counting() -> Arc<CountingResolver> {
        Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            inner: StaticCredentialResolver::new()
                .with_tenant("acme", CrmCredentials::new("https://acme.kommo.com", "tok-a")),
        })
    }

    #[tokio::test]
    async fn test_cache_resolves_once() {
        let resolver = counting();
        let cache = CredentialCache::new("acme", resolver.clone(), Duration::from_secs(60));

        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_cached().await);
    }

    #[tokio::test]
    async fn test_expired_token_is_resolved_again() {
        let resolver = counting();
        let cache = CredentialCache::new("acme", resolver.clone(), Duration::ZERO);

        cache.get().await.unwrap();
        cache.get().await.unwrap();

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_tenant_is_auth_missing_and_not_cached() {
        let resolver = counting();
        let cache = CredentialCache::new("globex", resolver.clone(), Duration::from_secs(60));

        let err = cache.get().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthMissing { ref tenant_id } if tenant_id == "globex"));
        assert!(!cache.is_cached().await);

        cache.get().await.unwrap_err();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = CredentialCache::new("acme", counting(), Duration::from_secs(60));
        cache.get().await.unwrap();
        cache.invalidate().await;
        assert!(!cache.is_cached().await);
    }

    #[test]
    fn test_url_join_and_redaction() {
        let creds = CrmCredentials::new("https://acme.kommo.com", "secret");
        assert_eq!(
            creds.url("/api/v4/leads").unwrap(),
            "https://acme.kommo.com/api/v4/leads"
        );
        assert!(!format!("{:?}", creds).contains("secret"));

        let bad = CrmCredentials::new("not a url", "x");
        assert!(matches!(bad.url("/api"), Err(SyncError::InvalidUrl(_))));
    }
}
