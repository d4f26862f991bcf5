//! The request pipeline.
//!
//! One call goes through these stages:
//! 1. interceptor adaptation
//! 2. cache lookup (a hit never touches the network)
//! 3. default-header merge and transport call under the retry executor
//! 4. a single post-refresh attempt when the server answers 401
//! 5. decoding and cache population on 2xx
//!
//! Every collaborator is injected through [`RequestPipelineBuilder`]; the
//! pipeline holds shared handles and owns no global state.

use crate::auth::{HttpTokenRefresher, TokenRefreshCoordinator};
use crate::cache::CacheStore;
use crate::cancel::CancellationToken;
use crate::config::ClientConfig;
use crate::error::{FerryError, Result};
use crate::interceptor::{Interceptor, InterceptorChain, TokenRefreshInterceptor};
use crate::multipart::MultipartForm;
use crate::network::{
    ConnectivityConfig, ConnectivityMonitor, ReqwestTransport, RetryExecutor, Transport,
};
use crate::offline::{
    FlushReport, JobRunner, OfflineJob, OfflineQueue, OfflineQueueStore, OfflineReplayer,
    ReplayHandler, ReplayRegistry,
};
use crate::request::{decode_json, HttpMethod, Request, Response};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Result of [`RequestPipeline::request_or_enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome<T> {
    Completed(T),
    /// Parked in the offline queue under this job id.
    Deferred(Uuid),
}

struct Inner {
    transport: Arc<dyn Transport>,
    base_url: Option<Url>,
    default_headers: BTreeMap<String, String>,
    cache: CacheStore,
    retry: RetryExecutor,
    interceptors: InterceptorChain,
    token_coordinator: Option<Arc<TokenRefreshCoordinator>>,
    connectivity: Arc<ConnectivityMonitor>,
    offline_queue: Arc<OfflineQueue>,
    replay: Arc<ReplayRegistry>,
}

/// Cheaply clonable handle to a configured pipeline.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<Inner>,
}

pub struct RequestPipelineBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<CacheStore>,
    interceptors: InterceptorChain,
    token_coordinator: Option<Arc<TokenRefreshCoordinator>>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    offline_queue: Option<Arc<OfflineQueue>>,
    replay: ReplayRegistry,
}

impl RequestPipelineBuilder {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            cache: None,
            interceptors: InterceptorChain::new(),
            token_coordinator: None,
            connectivity: None,
            offline_queue: None,
            replay: ReplayRegistry::new(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Append an interceptor. Interceptors run in the order they are added.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptors<I>(mut self, interceptors: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Interceptor>>,
    {
        for interceptor in interceptors {
            self.interceptors.push(interceptor);
        }
        self
    }

    /// Use `coordinator` for 401 recovery and add its token interceptor at
    /// this point in the interceptor order.
    pub fn token_coordinator(mut self, coordinator: Arc<TokenRefreshCoordinator>) -> Self {
        self.interceptors
            .push(Arc::new(TokenRefreshInterceptor::new(Arc::clone(&coordinator))));
        self.token_coordinator = Some(coordinator);
        self
    }

    pub fn connectivity(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    pub fn offline_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.offline_queue = Some(queue);
        self
    }

    /// Deliver replays of jobs tagged `tag` to `handler`.
    pub fn replay_handler(self, tag: impl Into<String>, handler: Arc<dyn ReplayHandler>) -> Self {
        self.replay.register(tag, handler);
        self
    }

    /// Fill in defaults for anything not injected and wire the pieces together.
    pub fn build(mut self) -> Result<RequestPipeline> {
        self.config.validate()?;
        let config = self.config;

        let base_url = config.base_url.as_deref().map(Url::parse).transpose()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::with_options(
                config.timeout,
                &config.user_agent,
            )?),
        };

        let cache = match self.cache {
            Some(cache) => cache,
            None => CacheStore::from_config(&config.cache)?,
        };

        if self.token_coordinator.is_none() {
            if let Some(refresh_url) = &config.refresh_url {
                let refresher = HttpTokenRefresher::new(Arc::clone(&transport), refresh_url.as_str());
                let coordinator = Arc::new(TokenRefreshCoordinator::new(Arc::new(refresher)));
                self.interceptors
                    .push(Arc::new(TokenRefreshInterceptor::new(Arc::clone(&coordinator))));
                self.token_coordinator = Some(coordinator);
            }
        }

        let connectivity = self
            .connectivity
            .unwrap_or_else(|| Arc::new(ConnectivityMonitor::new(true)));

        let offline_queue = match self.offline_queue {
            Some(queue) => queue,
            None => Arc::new(match &config.offline_queue_path {
                Some(path) => OfflineQueue::with_store(OfflineQueueStore::new(path)),
                None => OfflineQueue::new(),
            }),
        };

        let inner = Arc::new(Inner {
            transport,
            base_url,
            default_headers: config.default_headers,
            cache,
            retry: RetryExecutor::new(config.retry),
            interceptors: self.interceptors,
            token_coordinator: self.token_coordinator,
            connectivity,
            offline_queue,
            replay: Arc::new(self.replay),
        });

        let replayer = OfflineReplayer::new(
            Arc::clone(&inner.offline_queue),
            Arc::new(ReplayRunner {
                inner: Arc::downgrade(&inner),
            }),
        );
        inner.connectivity.add_listener(Arc::new(replayer));

        info!(
            "Request pipeline ready ({} interceptors, persistent cache: {})",
            inner.interceptors.len(),
            inner.cache.has_persistent_tier()
        );
        Ok(RequestPipeline { inner })
    }
}

impl RequestPipeline {
    pub fn builder(config: ClientConfig) -> RequestPipelineBuilder {
        RequestPipelineBuilder::new(config)
    }

    /// Pipeline with the default stack: reqwest transport, SQLite cache tier
    /// when configured, and a refresh coordinator when `refresh_url` is set.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.inner.connectivity
    }

    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.inner.offline_queue
    }

    pub fn token_coordinator(&self) -> Option<&Arc<TokenRefreshCoordinator>> {
        self.inner.token_coordinator.as_ref()
    }

    pub fn replay_registry(&self) -> &ReplayRegistry {
        &self.inner.replay
    }

    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.inner.retry
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.inner.base_url.as_ref()
    }

    /// Probe `config.probe_urls` in the background through this pipeline's transport.
    pub fn start_connectivity_probing(&self, config: ConnectivityConfig) {
        self.inner
            .connectivity
            .start_probing(Arc::clone(&self.inner.transport), config);
    }

    /// Run `request` and decode a 2xx body as `T`.
    pub async fn request<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        self.request_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn request_with_cancel<T: DeserializeOwned>(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<T> {
        cancel.check()?;
        let adapted = self.inner.interceptors.adapt(request.clone()).await?;

        let cache_key = adapted.is_cacheable().then(|| adapted.cache_key());
        if let Some(key) = &cache_key {
            if let Some(cached) = self.inner.cache.get(key) {
                match decode_json::<T>(&cached) {
                    Ok(value) => {
                        debug!("Cache hit for {}", key);
                        return Ok(value);
                    }
                    Err(e) => debug!("Cached entry for {} does not decode, refetching: {}", key, e),
                }
            } else {
                debug!("Cache miss for {}", key);
            }
        }

        let response = self.complete(request, adapted, cancel).await?;
        if !response.is_success() {
            return Err(response.into_server_error());
        }

        let value = decode_json::<T>(&response.body)?;
        if let Some(key) = cache_key {
            self.inner.cache.set(
                &key,
                response.body.clone(),
                Some(self.inner.cache.default_ttl()),
            );
        }
        Ok(value)
    }

    /// Run `request` through interceptors, retry and 401 recovery, and hand
    /// back the final response whatever its status. Skips the cache.
    pub async fn send_raw(&self, request: Request) -> Result<Response> {
        self.send_raw_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn send_raw_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        cancel.check()?;
        let adapted = self.inner.interceptors.adapt(request.clone()).await?;
        self.complete(request, adapted, cancel).await
    }

    /// POST `form` to `path`. Uploads are never cached.
    pub async fn upload<T: DeserializeOwned>(&self, path: &str, form: MultipartForm) -> Result<T> {
        self.request(form.into_request(path)).await
    }

    /// Run `request`, or park it in the offline queue when the device is
    /// offline and the request is a write.
    ///
    /// A write that fails with a network error while the monitor reports
    /// offline is parked as well. Reads are never deferred.
    pub async fn request_or_enqueue<T: DeserializeOwned>(
        &self,
        request: Request,
        replay_tag: Option<&str>,
    ) -> Result<RequestOutcome<T>> {
        let deferrable = is_deferrable(request.method());
        if deferrable && !self.inner.connectivity.is_online() {
            return Ok(RequestOutcome::Deferred(
                self.enqueue_offline(&request, replay_tag),
            ));
        }

        match self.request(request.clone()).await {
            Ok(value) => Ok(RequestOutcome::Completed(value)),
            Err(FerryError::Network { message, .. })
                if deferrable && !self.inner.connectivity.is_online() =>
            {
                info!("Deferring {} {} after network failure: {}", request.method(), request.path(), message);
                Ok(RequestOutcome::Deferred(
                    self.enqueue_offline(&request, replay_tag),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Park `request` for replay after reconnect and return the job id.
    ///
    /// The request is stored unadapted so the replay picks up whatever token
    /// is current at that time.
    pub fn enqueue_offline(&self, request: &Request, replay_tag: Option<&str>) -> Uuid {
        let mut job = OfflineJob::from_request(request);
        if let Some(tag) = replay_tag {
            job = job.with_replay_tag(tag);
        }
        let id = job.id;
        self.inner.offline_queue.enqueue(job);
        id
    }

    /// Replay everything in the offline queue now.
    pub async fn flush_offline(&self) -> FlushReport {
        let runner = Arc::new(ReplayRunner {
            inner: Arc::downgrade(&self.inner),
        });
        self.inner.offline_queue.flush(runner).await
    }

    /// Transport call plus the single bonus attempt after a 401.
    async fn complete(
        &self,
        original: Request,
        adapted: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let response = self.transmit(&adapted, cancel).await?;
        if response.status != 401 || adapted.is_auth_retry() {
            return Ok(response);
        }
        let Some(coordinator) = &self.inner.token_coordinator else {
            return Ok(response);
        };

        info!(
            "{} {} unauthorized, refreshing token and retrying once",
            adapted.method(),
            adapted.path()
        );
        // The refresh itself runs on its own task and keeps going for other
        // callers if this one is cancelled.
        let refreshed = async {
            match adapted.token_generation() {
                Some(seen) => coordinator.refresh_since(seen).await,
                None => coordinator.refresh().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FerryError::Cancelled),
            _ = refreshed => {}
        }

        let retry = self
            .inner
            .interceptors
            .adapt(original.into_auth_retry())
            .await?;
        let retry = self.with_default_headers(retry);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FerryError::Cancelled),
            outcome = self.inner.transport.send(&retry, self.inner.base_url.as_ref()) => outcome,
        };
        self.inner.interceptors.observe(&retry, outcome.as_ref()).await;
        outcome
    }

    /// One transport call under the retry executor, shown to every interceptor.
    async fn transmit(&self, adapted: &Request, cancel: &CancellationToken) -> Result<Response> {
        let prepared = self.with_default_headers(adapted.clone());
        let transport = &self.inner.transport;
        let base_url = self.inner.base_url.as_ref();

        let outcome = self
            .inner
            .retry
            .execute(cancel, || transport.send(&prepared, base_url))
            .await;
        self.inner.interceptors.observe(&prepared, outcome.as_ref()).await;
        outcome
    }

    /// Add default headers the request doesn't already set.
    fn with_default_headers(&self, mut request: Request) -> Request {
        for (name, value) in &self.inner.default_headers {
            if !request.has_header(name) {
                request = request.with_header(name.as_str(), value.as_str());
            }
        }
        request
    }
}

/// Requests that change server state and can be replayed later.
fn is_deferrable(method: HttpMethod) -> bool {
    !matches!(
        method,
        HttpMethod::Get | HttpMethod::Head | HttpMethod::Options
    )
}

/// Replays offline jobs through the pipeline.
///
/// Holds the pipeline weakly: the connectivity monitor keeps this runner
/// alive, and the pipeline keeps the monitor alive.
struct ReplayRunner {
    inner: Weak<Inner>,
}

#[async_trait]
impl JobRunner for ReplayRunner {
    async fn run(&self, job: OfflineJob) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            debug!("Pipeline dropped; skipping offline job {}", job.id);
            return Err(FerryError::Cancelled);
        };
        let pipeline = RequestPipeline { inner };

        let outcome = match pipeline.send_raw(job.to_request()).await {
            Err(e @ FerryError::Network { .. }) => {
                warn!(
                    "Offline job {} ({} {}) failed again, re-queueing: {}",
                    job.id, job.method, job.path, e
                );
                pipeline.inner.offline_queue.enqueue(job);
                return Err(e);
            }
            other => other,
        };

        pipeline.inner.replay.deliver(&job, &outcome).await;
        match outcome {
            Ok(response) if response.is_success() => {
                debug!("Offline job {} replayed with status {}", job.id, response.status);
                Ok(())
            }
            Ok(response) => Err(response.into_server_error()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::network::RetryConfig;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Response>>>,
        seen: Mutex<Vec<Request>>,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<Result<Response>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &Request, _base_url: Option<&Url>) -> Result<Response> {
            self.seen.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FerryError::network("script exhausted")))
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Post {
        id: u32,
    }

    fn config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.base_url = Some("https://api.test".to_string());
        config.retry = RetryConfig::new()
            .with_max_retries(1)
            .with_base_delay(Duration::from_millis(1));
        config
    }

    fn pipeline(transport: Arc<ScriptedTransport>, config: ClientConfig) -> RequestPipeline {
        RequestPipeline::builder(config)
            .transport(transport)
            .cache(CacheStore::new(&CacheConfig::default()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_defaults_do_not_override_request_headers() {
        let transport = ScriptedTransport::with(vec![Ok(Response::new(200, r#"{"id":1}"#))]);
        let mut config = config();
        config
            .default_headers
            .insert("Accept".to_string(), "application/json".to_string());
        config
            .default_headers
            .insert("X-Client".to_string(), "ferrylink".to_string());
        let pipeline = pipeline(transport.clone(), config);

        let post: Post = pipeline
            .request(Request::get("/posts/1").with_header("accept", "text/plain"))
            .await
            .unwrap();
        assert_eq!(post, Post { id: 1 });

        let sent = transport.seen.lock().unwrap()[0].clone();
        assert_eq!(sent.header("Accept"), Some("text/plain"));
        assert_eq!(sent.header("X-Client"), Some("ferrylink"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_transport() {
        let transport = ScriptedTransport::with(vec![Ok(Response::new(200, r#"{"id":7}"#))]);
        let pipeline = pipeline(transport.clone(), config());

        let first: Post = pipeline.request(Request::get("/posts/7")).await.unwrap();
        let second: Post = pipeline.request(Request::get("/posts/7")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_success_surfaces_status_and_body() {
        let transport = ScriptedTransport::with(vec![Ok(Response::new(404, "missing"))]);
        let pipeline = pipeline(transport.clone(), config());

        let err = pipeline
            .request::<Post>(Request::get("/posts/404"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(404));
        assert_eq!(err.body().map(|b| b.as_ref()), Some(&b"missing"[..]));
        assert!(!pipeline.cache().contains_memory("GET:/posts/404?"));
    }

    #[tokio::test]
    async fn test_post_is_not_cached() {
        let transport = ScriptedTransport::with(vec![
            Ok(Response::new(201, r#"{"id":1}"#)),
            Ok(Response::new(201, r#"{"id":2}"#)),
        ]);
        let pipeline = pipeline(transport.clone(), config());

        let a: Post = pipeline.request(Request::post("/posts")).await.unwrap();
        let b: Post = pipeline.request(Request::post("/posts")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_write_is_deferred_and_read_is_not() {
        let transport = ScriptedTransport::with(vec![]);
        let pipeline = pipeline(transport.clone(), config());
        pipeline.connectivity().set_online(false);

        let outcome = pipeline
            .request_or_enqueue::<Post>(Request::post("/comments"), Some("comments"))
            .await
            .unwrap();
        assert!(matches!(outcome, RequestOutcome::Deferred(_)));
        assert_eq!(pipeline.offline_queue().len(), 1);
        assert_eq!(transport.calls(), 0);

        let err = pipeline
            .request_or_enqueue::<Post>(Request::get("/posts/1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FerryError::Network { .. }));
        assert_eq!(pipeline.offline_queue().len(), 1);
    }

    #[derive(Default)]
    struct Statuses {
        seen: Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl ReplayHandler for Statuses {
        async fn on_replay(&self, _job: &OfflineJob, outcome: &Result<Response>) {
            if let Ok(response) = outcome {
                self.seen.lock().unwrap().push(response.status);
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_replays_and_delivers() {
        let transport = ScriptedTransport::with(vec![Ok(Response::new(201, "{}"))]);
        let handler = Arc::new(Statuses::default());
        let pipeline = RequestPipeline::builder(config())
            .transport(transport.clone())
            .cache(CacheStore::new(&CacheConfig::default()))
            .replay_handler("comments", handler.clone())
            .build()
            .unwrap();

        pipeline.connectivity().set_online(false);
        pipeline.enqueue_offline(&Request::post("/comments").with_body("hi"), Some("comments"));

        pipeline
            .connectivity()
            .set_online(true)
            .expect("restore notifies")
            .await
            .unwrap();

        assert!(pipeline.offline_queue().is_empty());
        assert_eq!(*handler.seen.lock().unwrap(), vec![201]);
        let sent = transport.seen.lock().unwrap()[0].clone();
        assert_eq!(sent.path(), "/comments");
        assert_eq!(sent.body().map(|b| b.as_ref()), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let transport = ScriptedTransport::with(vec![]);
        let pipeline = pipeline(transport.clone(), config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .request_with_cancel::<Post>(Request::get("/posts/1"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(transport.calls(), 0);
    }
}
