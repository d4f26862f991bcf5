//! Request adaptation and response observation hooks.
//!
//! Interceptors run in registration order. `adapt` threads the request
//! through each one; `observe` shows every interceptor the outcome of a
//! transport call, and its failures are logged rather than returned.

mod token;

pub use token::TokenRefreshInterceptor;

use crate::error::{FerryError, Result};
use crate::request::{Request, Response};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one transport call as seen by `observe`.
pub type Outcome<'a> = std::result::Result<&'a Response, &'a FerryError>;

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    async fn adapt(&self, request: Request) -> Result<Request> {
        Ok(request)
    }

    async fn observe(&self, _request: &Request, _outcome: Outcome<'_>) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        debug!("Registered interceptor: {}", interceptor.name());
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run every `adapt` in order, stopping at the first failure.
    pub async fn adapt(&self, mut request: Request) -> Result<Request> {
        for interceptor in &self.interceptors {
            request = interceptor.adapt(request).await?;
        }
        Ok(request)
    }

    /// Run every `observe` in order. Failures never stop the chain.
    pub async fn observe(&self, request: &Request, outcome: Outcome<'_>) {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.observe(request, outcome).await {
                warn!("Interceptor {} failed to observe response: {}", interceptor.name(), e);
            }
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| i.name()))
            .finish()
    }
}

/// Adds fixed headers to requests that don't already carry them.
pub struct HeaderInterceptor {
    headers: BTreeMap<String, String>,
}

impl HeaderInterceptor {
    pub fn new<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl Interceptor for HeaderInterceptor {
    fn name(&self) -> &str {
        "headers"
    }

    async fn adapt(&self, mut request: Request) -> Result<Request> {
        for (name, value) in &self.headers {
            if !request.has_header(name) {
                request = request.with_header(name.as_str(), value.as_str());
            }
        }
        Ok(request)
    }
}

/// Logs each call's method, path and status.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    async fn observe(&self, request: &Request, outcome: Outcome<'_>) -> Result<()> {
        match outcome {
            Ok(response) => info!(
                "{} {} -> {} ({} bytes)",
                request.method(),
                request.path(),
                response.status,
                response.body.len()
            ),
            Err(e) => warn!("{} {} failed: {}", request.method(), request.path(), e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Tagging {
        tag: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        fail_observe: bool,
    }

    #[async_trait]
    impl Interceptor for Tagging {
        fn name(&self) -> &str {
            self.tag
        }

        async fn adapt(&self, request: Request) -> Result<Request> {
            let trail = request.header("X-Trail").unwrap_or("").to_string();
            Ok(request.with_header("X-Trail", format!("{}{}", trail, self.tag)))
        }

        async fn observe(&self, _request: &Request, _outcome: Outcome<'_>) -> Result<()> {
            self.seen.lock().unwrap().push(self.tag);
            if self.fail_observe {
                return Err(FerryError::Unknown);
            }
            Ok(())
        }
    }

    fn chain(seen: &Arc<Mutex<Vec<&'static str>>>, fail_first: bool) -> InterceptorChain {
        let mut chain = InterceptorChain::new();
        for (i, tag) in ["a", "b", "c"].into_iter().enumerate() {
            chain.push(Arc::new(Tagging {
                tag,
                seen: Arc::clone(seen),
                fail_observe: fail_first && i == 0,
            }));
        }
        chain
    }

    #[tokio::test]
    async fn test_adapt_runs_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let adapted = chain(&seen, false).adapt(Request::get("/x")).await.unwrap();
        assert_eq!(adapted.header("x-trail"), Some("abc"));
    }

    #[tokio::test]
    async fn test_observe_failure_does_not_stop_chain() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let response = Response::new(200, "ok");
        chain(&seen, true)
            .observe(&Request::get("/x"), Ok(&response))
            .await;
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_header_interceptor_keeps_explicit_headers() {
        let interceptor = HeaderInterceptor::new([("Accept", "application/json"), ("X-App", "demo")]);
        let request = Request::get("/x").with_header("accept", "text/plain");
        let adapted = interceptor.adapt(request).await.unwrap();
        assert_eq!(adapted.header("Accept"), Some("text/plain"));
        assert_eq!(adapted.header("X-App"), Some("demo"));
    }
}
