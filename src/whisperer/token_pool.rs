//! Multi-credential token pool
//!
//! Process-wide pool that rotates among N refresh credentials, caches access
//! tokens per entry, and single-flights refreshes per index so a concurrent
//! burst of requests triggers at most one upstream exchange per credential.
//!
//! Locking discipline: one `parking_lot` mutex covers the cache read, the
//! in-flight map and the cursor advance; it is only ever held over
//! non-blocking operations, never across the HTTP exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use super::auth::{RefreshError, TokenRefresher};
use super::model::credentials::{AuthMethod, PoolCredential};

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct TokenPoolConfig {
    /// Bound on how long a waiter blocks on someone else's refresh
    pub refresh_timeout: Duration,
    /// Subtracted from the reported lifetime when computing expiry
    pub token_skew: Duration,
    /// Refresh failures before an entry is marked unavailable
    pub max_retries: u32,
}

impl Default for TokenPoolConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: Duration::from_secs(30),
            token_skew: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

/// Cached access token
#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// One credential plus its runtime state
struct TokenEntry {
    credential: PoolCredential,
    /// Consecutive refresh failures; bounded by `max_retries`
    failure_count: u32,
    last_success: Option<DateTime<Utc>>,
    cached: Option<AccessToken>,
    unavailable: bool,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<AccessToken, RefreshError>>>;

struct PoolInner {
    entries: Vec<TokenEntry>,
    /// Round-robin cursor, advanced on every fetch
    cursor: usize,
    /// At most one in-flight refresh per index
    inflight: HashMap<usize, SharedRefresh>,
}

/// Entry state snapshot for introspection and logs
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub method: AuthMethod,
    pub failure_count: u32,
    pub unavailable: bool,
    pub has_cached_token: bool,
    pub last_success: Option<DateTime<Utc>>,
}

/// Shared multi-credential token pool
pub struct TokenPool {
    inner: Mutex<PoolInner>,
    refresher: Arc<dyn TokenRefresher>,
    config: TokenPoolConfig,
}

impl TokenPool {
    /// Build the pool from a credential list.
    ///
    /// The list is deduplicated by (method, refresh-token[, client-id]) and
    /// every entry is validated; an empty result is an error.
    pub fn new(
        credentials: Vec<PoolCredential>,
        refresher: Arc<dyn TokenRefresher>,
        config: TokenPoolConfig,
    ) -> anyhow::Result<Self> {
        let credentials = super::model::credentials::sanitize_credentials(credentials);
        if credentials.is_empty() {
            anyhow::bail!("no valid credentials configured");
        }

        let entries = credentials
            .into_iter()
            .map(|credential| TokenEntry {
                credential,
                failure_count: 0,
                last_success: None,
                cached: None,
                unavailable: false,
            })
            .collect::<Vec<_>>();

        tracing::info!("token pool initialised with {} credential(s)", entries.len());

        Ok(Self {
            inner: Mutex::new(PoolInner {
                // First fetch advances to index 0
                cursor: entries.len() - 1,
                entries,
                inflight: HashMap::new(),
            }),
            refresher,
            config,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| !e.unavailable)
            .count()
    }

    /// Fetch a bearer token.
    ///
    /// Advances the round-robin cursor, serves from the per-index cache when
    /// possible, otherwise joins (or wins) the single-flight refresh for that
    /// index. Unusable indices are skipped; when every index has been tried
    /// the error is fatal for the request.
    pub async fn get_access_token(self: &Arc<Self>) -> anyhow::Result<String> {
        let total = self.len();
        let mut last_error: Option<RefreshError> = None;

        for _ in 0..total {
            let (index, refresh) = {
                let mut inner = self.inner.lock();
                inner.cursor = (inner.cursor + 1) % inner.entries.len();
                let index = inner.cursor;

                let entry = &inner.entries[index];
                if entry.unavailable {
                    continue;
                }
                if let Some(cached) = &entry.cached {
                    if cached.is_valid() {
                        return Ok(cached.token.clone());
                    }
                }

                // Single-flight: join the running refresh or become the winner
                let refresh = match inner.inflight.get(&index) {
                    Some(existing) => existing.clone(),
                    None => {
                        let credential = inner.entries[index].credential.clone();
                        let refresh = self.spawn_refresh(index, credential);
                        inner.inflight.insert(index, refresh.clone());
                        refresh
                    }
                };
                (index, refresh)
            };

            match tokio::time::timeout(self.config.refresh_timeout, refresh).await {
                Ok(Ok(token)) => return Ok(token.token),
                Ok(Err(e)) => {
                    tracing::warn!(index = index, "token refresh failed: {}", e);
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(index = index, "timed out waiting for in-flight refresh");
                    last_error = Some(RefreshError::new("timed out waiting for token refresh"));
                }
            }
        }

        match last_error {
            Some(e) => anyhow::bail!("all credentials exhausted: {}", e),
            None => anyhow::bail!("all credentials exhausted: no usable entries"),
        }
    }

    /// Start the refresh for `index` on a detached task.
    ///
    /// The task updates entry state and clears the in-flight slot itself, so
    /// it runs to completion (benefiting future waiters) even when every
    /// current waiter is cancelled.
    fn spawn_refresh(self: &Arc<Self>, index: usize, credential: PoolCredential) -> SharedRefresh {
        let pool = self.clone();
        let method = credential.method();
        let exchange = self.refresher.refresh(credential);

        let handle = tokio::spawn(async move {
            let result = exchange.await;
            pool.finish_refresh(index, method, result)
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(RefreshError::new(format!("refresh task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    /// Record a refresh outcome under the pool lock
    fn finish_refresh(
        &self,
        index: usize,
        method: AuthMethod,
        result: Result<super::auth::RefreshedToken, RefreshError>,
    ) -> Result<AccessToken, RefreshError> {
        let mut inner = self.inner.lock();
        inner.inflight.remove(&index);
        let max_retries = self.config.max_retries;
        let entry = &mut inner.entries[index];

        match result {
            Ok(refreshed) => {
                let lifetime = refreshed.expires_in.unwrap_or(3600);
                let expires_at = Utc::now()
                    + chrono::Duration::seconds(lifetime)
                    - chrono::Duration::from_std(self.config.token_skew)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0));

                let token = AccessToken {
                    token: refreshed.access_token,
                    expires_at,
                };
                entry.cached = Some(token.clone());
                entry.failure_count = 0;
                entry.last_success = Some(Utc::now());

                // Social refresh may rotate the refresh token; IdC never does
                if method == AuthMethod::Social {
                    if let Some(rotated) = refreshed.rotated_refresh_token {
                        entry.credential.refresh_token = rotated;
                    }
                }

                Ok(token)
            }
            Err(e) => {
                entry.failure_count += 1;
                if entry.failure_count >= max_retries {
                    entry.unavailable = true;
                    tracing::error!(
                        index = index,
                        failures = entry.failure_count,
                        "credential marked unavailable"
                    );
                }
                Err(e)
            }
        }
    }

    /// Invalidate every cached access token
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.iter_mut() {
            entry.cached = None;
        }
    }

    /// Evict expired cached tokens so idle periods cannot serve stale entries
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        for entry in inner.entries.iter_mut() {
            if entry.cached.as_ref().is_some_and(|t| !t.is_valid()) {
                entry.cached = None;
                evicted += 1;
            }
        }
        evicted
    }

    /// Background sweep loop evicting expired tokens
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = pool.sweep_expired();
                if evicted > 0 {
                    tracing::debug!("evicted {} expired token(s)", evicted);
                }
            }
        })
    }

    /// Entry state snapshots, in pool order
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|e| EntrySnapshot {
                method: e.credential.method(),
                failure_count: e.failure_count,
                unavailable: e.unavailable,
                has_cached_token: e.cached.is_some(),
                last_success: e.last_success,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted refresher: succeeds unless the refresh token starts with
    /// "bad", counts every exchange, and simulates endpoint latency.
    struct FakeRefresher {
        calls: AtomicUsize,
        latency: Duration,
        expires_in: i64,
    }

    impl FakeRefresher {
        fn new(latency: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                latency,
                expires_in: 3600,
            }
        }

        fn with_expires_in(latency: Duration, expires_in: i64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                latency,
                expires_in,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenRefresher for FakeRefresher {
        fn refresh(
            &self,
            credential: PoolCredential,
        ) -> futures::future::BoxFuture<'static, Result<super::super::auth::RefreshedToken, RefreshError>>
        {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let latency = self.latency;
            let expires_in = self.expires_in;
            async move {
                tokio::time::sleep(latency).await;
                if credential.refresh_token.starts_with("bad") {
                    Err(RefreshError::new("HTTP 500 from auth endpoint"))
                } else {
                    Ok(super::super::auth::RefreshedToken {
                        access_token: format!("access-{}-{}", credential.refresh_token, call),
                        expires_in: Some(expires_in),
                        rotated_refresh_token: None,
                        profile_arn: None,
                    })
                }
            }
            .boxed()
        }
    }

    fn pool_config() -> TokenPoolConfig {
        TokenPoolConfig {
            refresh_timeout: Duration::from_secs(5),
            token_skew: Duration::from_secs(60),
            max_retries: 3,
        }
    }

    fn make_pool(
        tokens: &[&str],
        refresher: Arc<FakeRefresher>,
        config: TokenPoolConfig,
    ) -> Arc<TokenPool> {
        let creds = tokens
            .iter()
            .map(|t| PoolCredential::social(*t))
            .collect::<Vec<_>>();
        Arc::new(TokenPool::new(creds, refresher, config).unwrap())
    }

    #[tokio::test]
    async fn test_single_flight_dedup() {
        // Ten concurrent fetches against a pool of one cold credential must
        // trigger exactly one refresh; everyone gets the same token.
        let refresher = Arc::new(FakeRefresher::new(Duration::from_millis(50)));
        let pool = make_pool(&["rt"], refresher.clone(), pool_config());

        let fetches = (0..10).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_access_token().await.unwrap() })
        });
        let tokens: Vec<String> = futures::future::join_all(fetches)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(refresher.calls(), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[tokio::test]
    async fn test_refresh_at_most_pool_size_calls() {
        // A burst against P indices performs at most P refreshes.
        let refresher = Arc::new(FakeRefresher::new(Duration::from_millis(20)));
        let pool = make_pool(&["a", "b", "c"], refresher.clone(), pool_config());

        let fetches = (0..30).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_access_token().await.unwrap() })
        });
        futures::future::join_all(fetches).await;

        assert!(refresher.calls() <= 3, "calls = {}", refresher.calls());
    }

    #[tokio::test]
    async fn test_cache_hit_after_refresh() {
        let refresher = Arc::new(FakeRefresher::new(Duration::ZERO));
        let pool = make_pool(&["rt"], refresher.clone(), pool_config());

        pool.get_access_token().await.unwrap();
        pool.get_access_token().await.unwrap();
        pool.get_access_token().await.unwrap();
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let refresher = Arc::new(FakeRefresher::new(Duration::ZERO));
        let pool = make_pool(&["a", "b"], refresher.clone(), pool_config());

        let first = pool.get_access_token().await.unwrap();
        let second = pool.get_access_token().await.unwrap();
        let third = pool.get_access_token().await.unwrap();

        // Cursor advances on every fetch, alternating the two entries
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn test_failure_cascade_to_good_credential() {
        // First two refreshes fail with a server error; the third succeeds.
        // The caller gets the good token; failed entries carry count 1.
        let refresher = Arc::new(FakeRefresher::new(Duration::ZERO));
        let pool = make_pool(&["bad1", "bad2", "good"], refresher.clone(), pool_config());

        let token = pool.get_access_token().await.unwrap();
        assert!(token.starts_with("access-good"));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot[0].failure_count, 1);
        assert_eq!(snapshot[1].failure_count, 1);
        assert_eq!(snapshot[2].failure_count, 0);
        assert!(snapshot[2].has_cached_token);
    }

    #[tokio::test]
    async fn test_entry_unavailable_after_max_retries() {
        let refresher = Arc::new(FakeRefresher::new(Duration::ZERO));
        let config = TokenPoolConfig {
            max_retries: 2,
            ..pool_config()
        };
        let pool = make_pool(&["bad"], refresher.clone(), config);

        assert!(pool.get_access_token().await.is_err());
        assert!(pool.get_access_token().await.is_err());
        assert_eq!(pool.available_count(), 0);

        // Unavailable entries are skipped without touching the endpoint
        let calls = refresher.calls();
        let err = pool.get_access_token().await.unwrap_err();
        assert!(err.to_string().contains("exhausted"));
        assert_eq!(refresher.calls(), calls);
    }

    #[tokio::test]
    async fn test_expired_token_triggers_refresh() {
        // Lifetime below the skew: the stored token is already expired
        let refresher = Arc::new(FakeRefresher::with_expires_in(Duration::ZERO, 10));
        let config = TokenPoolConfig {
            token_skew: Duration::from_secs(60),
            ..pool_config()
        };
        let pool = make_pool(&["rt"], refresher.clone(), config);

        pool.get_access_token().await.unwrap();
        pool.get_access_token().await.unwrap();
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_invalidates_cache() {
        let refresher = Arc::new(FakeRefresher::new(Duration::ZERO));
        let pool = make_pool(&["rt"], refresher.clone(), pool_config());

        pool.get_access_token().await.unwrap();
        pool.clear();
        pool.get_access_token().await.unwrap();
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired() {
        let refresher = Arc::new(FakeRefresher::with_expires_in(Duration::ZERO, 10));
        let config = TokenPoolConfig {
            token_skew: Duration::from_secs(60),
            ..pool_config()
        };
        let pool = make_pool(&["rt"], refresher.clone(), config);

        pool.get_access_token().await.ok();
        assert_eq!(pool.sweep_expired(), 1);
        assert_eq!(pool.sweep_expired(), 0);
    }

    #[test]
    fn test_construction_dedups() {
        let refresher = Arc::new(FakeRefresher::new(Duration::ZERO));
        let creds = vec![
            PoolCredential::social("rt"),
            PoolCredential::social("rt"),
            PoolCredential::social("other"),
        ];
        let pool = TokenPool::new(creds, refresher, pool_config()).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_construction_rejects_empty() {
        let refresher = Arc::new(FakeRefresher::new(Duration::ZERO));
        assert!(TokenPool::new(vec![], refresher, pool_config()).is_err());
    }
}
