//! Bearer token state and single-flight refresh.
//!
//! The coordinator owns the current token. A refresh runs on its own task and
//! is shared: every caller that asks for a refresh while one is running awaits
//! the same outcome, so concurrent 401s produce exactly one refresh call.
//!
//! Each completed refresh bumps a generation counter. Requests remember the
//! generation whose token they carried, which lets a late 401 recognise that a
//! refresh already happened after it was sent and skip starting another one.

use crate::error::{FerryError, Result};
use crate::network::Transport;
use crate::request::Request;
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Obtains a fresh bearer token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// `current` is the token in use when the refresh started.
    async fn refresh(&self, current: Option<String>) -> Result<String>;
}

type SharedRefresh = Shared<BoxFuture<'static, Option<String>>>;

#[derive(Default)]
struct TokenState {
    token: Option<String>,
    generation: u64,
    refreshes_started: u64,
    inflight: Option<SharedRefresh>,
}

fn lock_state(state: &Mutex<TokenState>) -> MutexGuard<'_, TokenState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the bearer token and serializes its renewal.
pub struct TokenRefreshCoordinator {
    state: Arc<Mutex<TokenState>>,
    refresher: Arc<dyn TokenRefresher>,
}

impl TokenRefreshCoordinator {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenState::default())),
            refresher,
        }
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        lock_state(&self.state).token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<String> {
        lock_state(&self.state).token.clone()
    }

    /// Token together with its generation.
    pub(crate) fn current(&self) -> (Option<String>, u64) {
        let state = lock_state(&self.state);
        (state.token.clone(), state.generation)
    }

    /// Replace the token from outside (e.g. after a fresh login).
    pub fn set_token(&self, token: Option<String>) {
        let mut state = lock_state(&self.state);
        state.token = token;
        state.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        lock_state(&self.state).generation
    }

    pub fn is_refreshing(&self) -> bool {
        lock_state(&self.state).inflight.is_some()
    }

    /// Number of refresh calls issued to the refresher so far.
    pub fn refresh_count(&self) -> u64 {
        lock_state(&self.state).refreshes_started
    }

    /// Refresh the token, joining a refresh that is already running.
    ///
    /// Resolves to the token held once the refresh settles. A failed refresh
    /// keeps the previous token.
    pub async fn refresh(&self) -> Option<String> {
        match self.begin(None) {
            Some(inflight) => inflight.await,
            None => self.token(),
        }
    }

    /// Refresh unless a refresh has completed since generation `seen`.
    pub async fn refresh_since(&self, seen: u64) -> Option<String> {
        match self.begin(Some(seen)) {
            Some(inflight) => inflight.await,
            None => self.token(),
        }
    }

    /// Start a refresh without waiting for it.
    ///
    /// Returns whether a refresh is running afterwards.
    pub fn trigger_refresh(&self) -> bool {
        self.begin(None).is_some()
    }

    pub(crate) fn trigger_refresh_since(&self, seen: u64) -> bool {
        self.begin(Some(seen)).is_some()
    }

    /// Join the in-flight refresh or start a new one.
    ///
    /// `None` means no refresh is needed (or none can run without a runtime).
    fn begin(&self, seen: Option<u64>) -> Option<SharedRefresh> {
        let mut state = lock_state(&self.state);
        if let Some(inflight) = &state.inflight {
            debug!("Joining in-flight token refresh");
            return Some(inflight.clone());
        }
        if let Some(seen) = seen {
            if state.generation > seen {
                debug!(
                    "Token already refreshed since generation {} (now {})",
                    seen, state.generation
                );
                return None;
            }
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available; cannot refresh token");
                return None;
            }
        };

        let current = state.token.clone();
        let refresher = Arc::clone(&self.refresher);
        let shared_state = Arc::clone(&self.state);
        state.refreshes_started += 1;
        info!("Refreshing bearer token");

        // The task clears `inflight` under the same lock held here, so it
        // cannot finish before `inflight` is published.
        let task = runtime.spawn(async move {
            let outcome = AssertUnwindSafe(refresher.refresh(current))
                .catch_unwind()
                .await;
            let mut state = lock_state(&shared_state);
            state.inflight = None;
            state.generation += 1;
            match outcome {
                Ok(Ok(token)) => {
                    info!("Token refresh succeeded");
                    state.token = Some(token);
                }
                Ok(Err(e)) => warn!("Token refresh failed, keeping previous token: {}", e),
                Err(_) => warn!("Token refresher panicked, keeping previous token"),
            }
            state.token.clone()
        });

        let inflight = async move { task.await.unwrap_or(None) }.boxed().shared();
        state.inflight = Some(inflight.clone());
        Some(inflight)
    }
}

#[derive(Deserialize)]
struct TokenPayload {
    token: String,
}

/// POSTs to a refresh endpoint and reads the new token from the response.
///
/// Accepts `{"token": "..."}` or a plain-text body holding the token.
pub struct HttpTokenRefresher {
    transport: Arc<dyn Transport>,
    url: String,
}

impl HttpTokenRefresher {
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
        }
    }

    fn parse_token(body: &[u8]) -> Result<String> {
        if let Ok(payload) = serde_json::from_slice::<TokenPayload>(body) {
            return Ok(payload.token);
        }
        let text = std::str::from_utf8(body)
            .map_err(FerryError::decoding)?
            .trim()
            .trim_matches('"');
        if text.is_empty() {
            return Err(FerryError::Decoding {
                message: "Refresh response carried no token".to_string(),
            });
        }
        Ok(text.to_string())
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, current: Option<String>) -> Result<String> {
        let mut request = Request::post(self.url.as_str());
        if let Some(token) = current {
            request = request.with_header("Authorization", format!("Bearer {}", token));
        }
        let response = self.transport.send(&request, None).await?;
        if !response.is_success() {
            return Err(response.into_server_error());
        }
        Self::parse_token(&response.body)
    }
}

/// Always hands out the same token.
pub struct StaticTokenRefresher {
    token: String,
}

impl StaticTokenRefresher {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for StaticTokenRefresher {
    async fn refresh(&self, _current: Option<String>) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Response;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    struct SlowRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for SlowRefresher {
        async fn refresh(&self, _current: Option<String>) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                Err(FerryError::network("refresh endpoint down"))
            } else {
                Ok(format!("token-{}", n))
            }
        }
    }

    fn slow(fail: bool) -> Arc<SlowRefresher> {
        Arc::new(SlowRefresher {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_call() {
        let refresher = slow(false);
        let coordinator = Arc::new(TokenRefreshCoordinator::new(refresher.clone()));

        let a = {
            let c = Arc::clone(&coordinator);
            tokio::spawn(async move { c.refresh().await })
        };
        let b = {
            let c = Arc::clone(&coordinator);
            tokio::spawn(async move { c.refresh().await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.as_deref(), Some("token-1"));
        assert_eq!(a, b);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_count(), 1);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_token() {
        let coordinator = TokenRefreshCoordinator::new(slow(true)).with_token("old");
        assert_eq!(coordinator.refresh().await.as_deref(), Some("old"));
        assert_eq!(coordinator.token().as_deref(), Some("old"));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_trigger_then_refresh_joins() {
        let refresher = slow(false);
        let coordinator = TokenRefreshCoordinator::new(refresher.clone());

        assert!(coordinator.trigger_refresh());
        assert!(coordinator.is_refreshing());
        assert_eq!(coordinator.refresh().await.as_deref(), Some("token-1"));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_since_skips_completed_generation() {
        let refresher = slow(false);
        let coordinator = TokenRefreshCoordinator::new(refresher.clone());
        let (_, seen) = coordinator.current();

        coordinator.refresh().await;
        assert_eq!(
            coordinator.refresh_since(seen).await.as_deref(),
            Some("token-1")
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let (_, seen) = coordinator.current();
        assert_eq!(
            coordinator.refresh_since(seen).await.as_deref(),
            Some("token-2")
        );
    }

    #[test]
    fn test_trigger_without_runtime_is_noop() {
        let coordinator = TokenRefreshCoordinator::new(Arc::new(StaticTokenRefresher::new("t")));
        assert!(!coordinator.trigger_refresh());
        assert!(coordinator.token().is_none());
    }

    struct RefreshEndpoint {
        body: &'static str,
        status: u16,
    }

    #[async_trait]
    impl Transport for RefreshEndpoint {
        async fn send(&self, request: &Request, _base_url: Option<&Url>) -> Result<Response> {
            assert_eq!(request.header("authorization"), Some("Bearer stale"));
            Ok(Response::new(self.status, self.body))
        }
    }

    #[tokio::test]
    async fn test_http_refresher_reads_json_or_text() {
        let json = HttpTokenRefresher::new(
            Arc::new(RefreshEndpoint {
                body: r#"{"token":"fresh"}"#,
                status: 200,
            }),
            "https://auth.test/refresh",
        );
        assert_eq!(json.refresh(Some("stale".into())).await.unwrap(), "fresh");

        let text = HttpTokenRefresher::new(
            Arc::new(RefreshEndpoint {
                body: "plain-token\n",
                status: 200,
            }),
            "https://auth.test/refresh",
        );
        assert_eq!(text.refresh(Some("stale".into())).await.unwrap(), "plain-token");
    }

    #[tokio::test]
    async fn test_http_refresher_surfaces_status() {
        let refresher = HttpTokenRefresher::new(
            Arc::new(RefreshEndpoint {
                body: "nope",
                status: 403,
            }),
            "https://auth.test/refresh",
        );
        let err = refresher.refresh(Some("stale".into())).await.unwrap_err();
        assert_eq!(err.status_code(), Some(403));
    }
}
