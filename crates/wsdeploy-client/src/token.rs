//! Bearer token caching with single-flight refresh
//!
//! The [`TokenManager`] hands out a cached token while it is comfortably
//! before expiry. Once the cache is empty, inside the refresh margin, or
//! invalidated after a 401, exactly one caller refreshes while the rest wait
//! on the refresh lock and then reuse the new token. Waiters accept that token
//! as long as it has not expired, even when it is already inside the margin.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Default scope requested from the credential source
pub const DEFAULT_SCOPE: &str = "https://api.fabric.microsoft.com/.default";

/// Refresh this long before the token actually expires
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Lifetime assumed for tokens whose expiry cannot be decoded
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Errors raised while obtaining a token
#[derive(Error, Debug)]
pub enum TokenError {
    /// The credential source itself failed
    #[error("credential source failed: {0}")]
    Source(String),

    /// The credential source returned an empty secret
    #[error("credential source returned an empty token")]
    EmptyToken,
}

/// A bearer token and the instant it stops being valid
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        AccessToken {
            secret: secret.into(),
            expires_at,
        }
    }

    /// Build a token from a raw JWT, reading expiry from its `exp` claim.
    ///
    /// Opaque tokens, or JWTs without `exp`, expire `fallback_lifetime` from now.
    pub fn from_jwt(raw: impl Into<String>, fallback_lifetime: Duration) -> Self {
        let secret = raw.into();
        let expires_at = jwt_expiry(&secret).unwrap_or_else(|| {
            Utc::now()
                + chrono::Duration::from_std(fallback_lifetime)
                    .unwrap_or_else(|_| chrono::Duration::hours(1))
        });
        AccessToken { secret, expires_at }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True while `now + margin` is still before expiry
    pub fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        now + margin < self.expires_at
    }
}

fn jwt_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let payload = raw.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

/// Supplies bearer tokens on demand
///
/// Implemented by the embedding application (CLI login, managed identity,
/// service principal ...). Failures are opaque to this crate.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch_token(&self, scope: &str) -> anyhow::Result<AccessToken>;
}

/// Caches a token from a [`CredentialSource`] and refreshes it single-flight
pub struct TokenManager {
    source: Arc<dyn CredentialSource>,
    scope: String,
    refresh_margin: Duration,
    cached: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
    generation: AtomicU64,
}

impl TokenManager {
    pub fn new(source: Arc<dyn CredentialSource>, scope: impl Into<String>) -> Self {
        TokenManager {
            source,
            scope: scope.into(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refreshes: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Set how long before expiry a token is considered stale
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Number of times the credential source has been asked for a token
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Return a valid token, refreshing when absent or near expiry
    pub async fn get_token(&self) -> Result<AccessToken, TokenError> {
        let observed = self.generation.load(Ordering::SeqCst);
        if let Some(token) = self.fresh_cached().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller refreshed while this one waited for the lock.
        if self.generation.load(Ordering::SeqCst) != observed {
            if let Some(token) = self.unexpired_cached().await {
                return Ok(token);
            }
        }
        if let Some(token) = self.fresh_cached().await {
            return Ok(token);
        }
        self.refresh_locked().await
    }

    /// Force a refresh after `stale` was rejected by the server.
    ///
    /// If the cache already holds a different token, someone else refreshed
    /// in the meantime and that token is returned instead.
    pub async fn invalidate(&self, stale: &AccessToken) -> Result<AccessToken, TokenError> {
        let _guard = self.refresh_lock.lock().await;
        {
            let cached = self.cached.read().await;
            if let Some(current) = cached.as_ref() {
                let unexpired = current.is_fresh(Duration::ZERO, Utc::now());
                if current.secret() != stale.secret() && unexpired {
                    return Ok(current.clone());
                }
            }
        }
        self.refresh_locked().await
    }

    async fn fresh_cached(&self) -> Option<AccessToken> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|token| token.is_fresh(self.refresh_margin, Utc::now()))
            .cloned()
    }

    async fn unexpired_cached(&self) -> Option<AccessToken> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|token| token.is_fresh(Duration::ZERO, Utc::now()))
            .cloned()
    }

    // Caller must hold `refresh_lock`.
    async fn refresh_locked(&self) -> Result<AccessToken, TokenError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        debug!(scope = %self.scope, "Requesting access token from credential source");

        let token = self
            .source
            .fetch_token(&self.scope)
            .await
            .map_err(|err| TokenError::Source(format!("{err:#}")))?;
        if token.secret().is_empty() {
            return Err(TokenError::EmptyToken);
        }

        *self.cached.write().await = Some(token.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(
            event = "token_refreshed",
            scope = %self.scope,
            expires_at = %token.expires_at(),
            "Access token refreshed"
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeCredential;

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{claims}.sig")
    }

    #[test]
    fn from_jwt_reads_exp_claim() {
        let token = AccessToken::from_jwt(jwt_with_exp(1_900_000_000), DEFAULT_TOKEN_LIFETIME);
        assert_eq!(token.expires_at().timestamp(), 1_900_000_000);
    }

    #[test]
    fn from_jwt_falls_back_for_opaque_tokens() {
        let before = Utc::now();
        let token = AccessToken::from_jwt("not-a-jwt", Duration::from_secs(600));
        let lifetime = token.expires_at() - before;
        assert!(lifetime >= chrono::Duration::seconds(599));
        assert!(lifetime <= chrono::Duration::seconds(601));
    }

    #[test]
    fn freshness_respects_margin() {
        let now = Utc::now();
        let token = AccessToken::new("t", now + chrono::Duration::seconds(100));
        assert!(token.is_fresh(Duration::from_secs(10), now));
        assert!(!token.is_fresh(Duration::from_secs(200), now));
    }

    #[test]
    fn debug_redacts_secret() {
        let token = AccessToken::new("super-secret", Utc::now());
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[tokio::test]
    async fn cached_token_is_reused() {
        let source = Arc::new(FakeCredential::new(Duration::from_secs(3600)));
        let manager = TokenManager::new(source.clone(), DEFAULT_SCOPE);

        let first = manager.get_token().await.unwrap();
        let second = manager.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed() {
        let source = Arc::new(FakeCredential::new(Duration::from_secs(60)));
        let manager =
            TokenManager::new(source.clone(), DEFAULT_SCOPE).with_refresh_margin(Duration::from_secs(120));

        manager.get_token().await.unwrap();
        manager.get_token().await.unwrap();

        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn invalidate_refreshes_once_per_stale_token() {
        let source = Arc::new(FakeCredential::new(Duration::from_secs(3600)));
        let manager = TokenManager::new(source.clone(), DEFAULT_SCOPE);

        let stale = manager.get_token().await.unwrap();
        let renewed = manager.invalidate(&stale).await.unwrap();
        let again = manager.invalidate(&stale).await.unwrap();

        assert_ne!(stale.secret(), renewed.secret());
        assert_eq!(renewed, again);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn credential_failure_surfaces() {
        let source = Arc::new(FakeCredential::failing());
        let manager = TokenManager::new(source.clone(), DEFAULT_SCOPE);

        let err = manager.get_token().await.unwrap_err();
        assert!(matches!(err, TokenError::Source(_)));
        assert_eq!(source.fetch_count(), 1);
    }
}
