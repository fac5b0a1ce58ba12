//! Per-service access token cache with single-flight fetches.
//!
//! Each service has at most one fetch in flight. Requests arriving while it
//! runs subscribe to it and all receive the same result. A fresh cached token
//! is handed out synchronously.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use secrecy::SecretString;
use service_control_sdk::{
    AccessToken, CancelHandle, TokenCallback, TokenError, TokenFetcher, TokenProvider,
};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::{ServiceControlConfig, TokenCacheConfig};

/// Caching, deduplicating [`TokenProvider`] on top of a [`TokenFetcher`].
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Arc<dyn TokenFetcher>,
    refresh_margin: Duration,
    slots: DashMap<String, Slot>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Slot {
    cached: Option<CachedToken>,
    in_flight: Option<InFlight>,
}

struct CachedToken {
    token: SecretString,
    refresh_at: Instant,
}

struct InFlight {
    fetch_id: u64,
    waiters: Mutex<HashMap<u64, TokenCallback>>,
    abort: AbortHandle,
}

impl TokenCache {
    #[must_use]
    pub fn new(fetcher: Arc<dyn TokenFetcher>, config: &TokenCacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                refresh_margin: Duration::from_secs(config.refresh_margin_secs),
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl TokenProvider for TokenCache {
    fn get_token(&self, service_name: &str, on_done: TokenCallback) -> CancelHandle {
        let inner = &self.inner;
        let mut slot = inner.slots.entry(service_name.to_owned()).or_default();

        if let Some(cached) = slot.cached.as_ref().filter(|c| Instant::now() < c.refresh_at) {
            let token = cached.token.clone();
            drop(slot);
            on_done(Ok(token));
            return CancelHandle::noop();
        }

        let waiter_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let fetch_id = if let Some(in_flight) = slot.in_flight.as_ref() {
            in_flight.waiters.lock().insert(waiter_id, on_done);
            in_flight.fetch_id
        } else {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                drop(slot);
                on_done(Err(TokenError::Fetch(
                    "no async runtime available".to_owned(),
                )));
                return CancelHandle::noop();
            };
            let fetch_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(service_name, fetch_id, "Starting token fetch");
            let task = runtime.spawn(run_fetch(
                Arc::clone(inner),
                service_name.to_owned(),
                fetch_id,
            ));
            slot.in_flight = Some(InFlight {
                fetch_id,
                waiters: Mutex::new(HashMap::from([(waiter_id, on_done)])),
                abort: task.abort_handle(),
            });
            fetch_id
        };
        drop(slot);

        let weak = Arc::downgrade(inner);
        let service_name = service_name.to_owned();
        CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel_waiter(&service_name, fetch_id, waiter_id);
            }
        })
    }
}

async fn run_fetch(inner: Arc<Inner>, service_name: String, fetch_id: u64) {
    let mut guard = FetchGuard {
        inner,
        service_name,
        fetch_id,
        finished: false,
    };
    let result = guard.inner.fetcher.fetch_token(&guard.service_name).await;
    guard.finished = true;
    guard.inner.complete(&guard.service_name, fetch_id, result);
}

/// Resolves the waiters of a fetch task that ends without a result, either by
/// panicking or by being dropped with its runtime.
///
/// An abort issued by [`Inner::cancel_waiter`] has already detached the fetch,
/// so the completion here is ignored as stale.
struct FetchGuard {
    inner: Arc<Inner>,
    service_name: String,
    fetch_id: u64,
    finished: bool,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let err = if std::thread::panicking() {
            TokenError::Fetch("token fetch task panicked".to_owned())
        } else {
            TokenError::Cancelled
        };
        self.inner.complete(&self.service_name, self.fetch_id, Err(err));
    }
}

impl Inner {
    fn complete(&self, service_name: &str, fetch_id: u64, result: Result<AccessToken, TokenError>) {
        let (waiters, delivered) = {
            let Some(mut slot) = self.slots.get_mut(service_name) else {
                return;
            };
            if slot.in_flight.as_ref().map(|f| f.fetch_id) != Some(fetch_id) {
                // Superseded: every waiter of this fetch cancelled.
                return;
            }
            let Some(in_flight) = slot.in_flight.take() else {
                return;
            };
            let delivered = match result {
                Ok(access) => {
                    let lifetime = access.expires_in.saturating_sub(self.refresh_margin);
                    slot.cached = Some(CachedToken {
                        token: access.token.clone(),
                        refresh_at: Instant::now() + lifetime,
                    });
                    Ok(access.token)
                }
                Err(err) => {
                    tracing::warn!(service_name, error = %err, "Token fetch failed");
                    Err(err)
                }
            };
            (in_flight.waiters.into_inner(), delivered)
        };

        tracing::debug!(
            service_name,
            fetch_id,
            waiters = waiters.len(),
            "Token fetch completed"
        );
        for (_, on_done) in waiters {
            on_done(delivered.clone());
        }
    }

    fn cancel_waiter(&self, service_name: &str, fetch_id: u64, waiter_id: u64) {
        let (removed, abandoned) = {
            let Some(mut slot) = self.slots.get_mut(service_name) else {
                return;
            };
            let Some(in_flight) = slot.in_flight.as_ref() else {
                return;
            };
            if in_flight.fetch_id != fetch_id {
                return;
            }
            let (removed, last) = {
                let mut waiters = in_flight.waiters.lock();
                let removed = waiters.remove(&waiter_id);
                (removed, waiters.is_empty())
            };
            let abandoned = if last { slot.in_flight.take() } else { None };
            (removed, abandoned)
        };

        // Abort outside the shard lock; the dropped task re-enters `complete`.
        if let Some(abandoned) = abandoned {
            tracing::debug!(service_name, fetch_id, "Last waiter left, aborting token fetch");
            abandoned.abort.abort();
        }
        drop(removed);
    }
}

/// Nominal lifetime of statically configured tokens.
const STATIC_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// [`TokenFetcher`] serving tokens straight from configuration.
pub struct StaticTokenFetcher {
    tokens: HashMap<String, SecretString>,
}

impl StaticTokenFetcher {
    #[must_use]
    pub fn new(tokens: HashMap<String, SecretString>) -> Self {
        Self { tokens }
    }

    /// Collect `access_token` of every configured service.
    #[must_use]
    pub fn from_config(cfg: &ServiceControlConfig) -> Self {
        let tokens = cfg
            .services
            .iter()
            .filter_map(|s| {
                s.access_token
                    .as_ref()
                    .map(|t| (s.service_name.clone(), t.clone()))
            })
            .collect();
        Self::new(tokens)
    }
}

#[async_trait]
impl TokenFetcher for StaticTokenFetcher {
    async fn fetch_token(&self, service_name: &str) -> Result<AccessToken, TokenError> {
        self.tokens
            .get(service_name)
            .map(|token| AccessToken {
                token: token.clone(),
                expires_in: STATIC_TOKEN_LIFETIME,
            })
            .ok_or_else(|| TokenError::NotConfigured(service_name.to_owned()))
    }
}
