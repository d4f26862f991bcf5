//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use ferrylink::cache::CacheConfig;
use ferrylink::network::{DownloadStream, DownloadTransport, RetryConfig, Transport};
use ferrylink::{CacheStore, ClientConfig, FerryError, Request, Response, Result, TokenRefresher};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

type Route = Box<dyn Fn(&Request) -> Result<Response> + Send + Sync>;

/// Transport that answers from a script first, then from a routing function.
pub struct MockTransport {
    script: Mutex<VecDeque<Result<Response>>>,
    route: Route,
    requests: Mutex<Vec<Request>>,
    delays: Mutex<VecDeque<Duration>>,
}

impl MockTransport {
    pub fn scripted(responses: Vec<Result<Response>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses.into()),
            route: Box::new(|_| Err(FerryError::network("no scripted response left"))),
            requests: Mutex::new(Vec::new()),
            delays: Mutex::new(VecDeque::new()),
        })
    }

    pub fn routed<F>(route: F) -> Arc<Self>
    where
        F: Fn(&Request) -> Result<Response> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            route: Box::new(route),
            requests: Mutex::new(Vec::new()),
            delays: Mutex::new(VecDeque::new()),
        })
    }

    /// Stall the next calls, one delay per call, before answering.
    pub fn delay_calls(&self, delays: Vec<Duration>) {
        self.delays.lock().unwrap().extend(delays);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path() == path)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request, _base_url: Option<&Url>) -> Result<Response> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => (self.route)(request),
        }
    }
}

/// Hands out `fresh-N` tokens after an optional delay, counting calls.
pub struct CountingRefresher {
    pub calls: AtomicUsize,
    delay: Duration,
}

impl CountingRefresher {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, _current: Option<String>) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(format!("fresh-{}", n))
    }
}

/// Config pointing at a fake host with fast, bounded retries.
pub fn test_config(max_retries: u32) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.base_url = Some("https://api.test".to_string());
    config.retry = RetryConfig::new()
        .with_max_retries(max_retries)
        .with_base_delay(Duration::from_millis(5));
    config
}

pub fn memory_cache() -> CacheStore {
    CacheStore::new(&CacheConfig::default())
}

pub fn json(status: u16, body: &str) -> Result<Response> {
    Ok(Response::new(status, body.to_string()).with_header("Content-Type", "application/json"))
}

pub const MIB: usize = 1024 * 1024;

/// Serves a large payload lazily from one shared 1 MiB chunk.
///
/// The first `fail_opens` opens break after `fail_after_chunks` chunks.
pub struct ChunkedDownload {
    chunk: Bytes,
    total_chunks: usize,
    fail_after_chunks: usize,
    fail_opens: AtomicUsize,
    pub offsets: Mutex<Vec<u64>>,
    pub bytes_served: AtomicUsize,
}

impl ChunkedDownload {
    pub fn new(total_chunks: usize, fail_after_chunks: usize, fail_opens: usize) -> Arc<Self> {
        Arc::new(Self {
            chunk: Bytes::from(vec![0xA5u8; MIB]),
            total_chunks,
            fail_after_chunks,
            fail_opens: AtomicUsize::new(fail_opens),
            offsets: Mutex::new(Vec::new()),
            bytes_served: AtomicUsize::new(0),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        (self.total_chunks * MIB) as u64
    }
}

#[async_trait]
impl DownloadTransport for ChunkedDownload {
    async fn open(&self, _url: &str, offset: u64, _validator: Option<&str>) -> Result<DownloadStream> {
        self.offsets.lock().unwrap().push(offset);
        let first_chunk = offset as usize / MIB;
        let remaining = self.total_chunks - first_chunk;

        let failing = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let served_chunks = if failing {
            self.fail_after_chunks.min(remaining)
        } else {
            remaining
        };

        let chunk = self.chunk.clone();
        let body = futures::stream::iter(0..served_chunks)
            .map(move |_| Ok::<Bytes, FerryError>(chunk.clone()))
            .chain(futures::stream::iter(
                failing.then(|| Err(FerryError::network("connection reset"))),
            ));
        self.bytes_served
            .fetch_add(served_chunks * MIB, Ordering::SeqCst);

        Ok(DownloadStream {
            status: if offset > 0 { 206 } else { 200 },
            content_length: Some((remaining * MIB) as u64),
            total_size: Some(self.total_bytes()),
            validator: Some("\"v1\"".to_string()),
            body: Box::pin(body),
        })
    }
}
