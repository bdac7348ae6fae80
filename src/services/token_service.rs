// services/token_service.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};

/// Tokens are treated as expired this long before the provider says they are.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

// Keep the token itself out of logs
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(REFRESH_MARGIN_SECS) > now
    }
}

/// One round trip to the provider's identity endpoint.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken>;
}

/// What the payment initiator needs from a credential source.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<AccessToken>;

    /// Drops `token` from the cache if it is still the cached one.
    async fn invalidate(&self, token: &str);
}

struct RefreshState {
    last_failure: Option<(Instant, String)>,
}

/// Caching, single-flight token manager.
///
/// Readers take the fast path through `cached`. A miss serializes on `refresh`, so concurrent
/// callers wait for the one in-flight fetch instead of issuing their own. A failed fetch is
/// remembered only for `retry_backoff`.
pub struct TokenManager {
    fetcher: Arc<dyn TokenFetcher>,
    cached: RwLock<Option<AccessToken>>,
    refresh: Mutex<RefreshState>,
    retry_backoff: Duration,
}

impl TokenManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>, retry_backoff: Duration) -> Self {
        TokenManager {
            fetcher,
            cached: RwLock::new(None),
            refresh: Mutex::new(RefreshState { last_failure: None }),
            retry_backoff,
        }
    }

    async fn cached_token(&self) -> Option<AccessToken> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|token| token.is_fresh(Utc::now()))
            .cloned()
    }
}

#[async_trait]
impl TokenProvider for TokenManager {
    async fn get_token(&self) -> Result<AccessToken> {
        if let Some(token) = self.cached_token().await {
            debug!("Using cached access token");
            return Ok(token);
        }

        let mut refresh = self.refresh.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(token) = self.cached_token().await {
            debug!("Using access token refreshed by a concurrent caller");
            return Ok(token);
        }

        if let Some((failed_at, reason)) = &refresh.last_failure {
            if failed_at.elapsed() < self.retry_backoff {
                return Err(AppError::provider_auth(format!(
                    "token fetch failed recently, retry later: {}",
                    reason
                )));
            }
        }

        info!("Requesting new M-Pesa access token");
        match self.fetcher.fetch_token().await {
            Ok(token) => {
                refresh.last_failure = None;
                *self.cached.write().await = Some(token.clone());
                info!("Access token obtained, expires at {}", token.expires_at);
                Ok(token)
            }
            Err(e) => {
                let reason = match e {
                    AppError::ProviderAuthError(msg) => msg,
                    other => other.to_string(),
                };
                warn!("Failed to get access token: {}", reason);
                refresh.last_failure = Some((Instant::now(), reason.clone()));
                Err(AppError::ProviderAuthError(reason))
            }
        }
    }

    async fn invalidate(&self, token: &str) {
        let mut cached = self.cached.write().await;
        if cached.as_ref().is_some_and(|current| current.token == token) {
            info!("Invalidating rejected access token");
            *cached = None;
        }
    }
}
