//! Delivery of replay outcomes and the flush-on-reconnect listener.

use super::job::OfflineJob;
use super::queue::{JobRunner, OfflineQueue};
use crate::error::Result;
use crate::network::ConnectivityListener;
use crate::request::Response;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Receives the result of a replayed job.
///
/// Registered per replay tag; this is how a caller that deferred a request
/// learns what eventually happened to it.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn on_replay(&self, job: &OfflineJob, outcome: &Result<Response>);
}

#[derive(Default)]
pub struct ReplayRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ReplayHandler>>>,
}

impl ReplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, replacing any earlier one.
    pub fn register(&self, tag: impl Into<String>, handler: Arc<dyn ReplayHandler>) {
        let tag = tag.into();
        debug!("Registered replay handler for tag '{}'", tag);
        match self.handlers.write() {
            Ok(mut handlers) => handlers.insert(tag, handler),
            Err(poisoned) => poisoned.into_inner().insert(tag, handler),
        };
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn ReplayHandler>> {
        match self.handlers.read() {
            Ok(handlers) => handlers.get(tag).cloned(),
            Err(poisoned) => poisoned.into_inner().get(tag).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand `outcome` to the handler registered for the job's tag, if any.
    pub async fn deliver(&self, job: &OfflineJob, outcome: &Result<Response>) {
        let Some(tag) = job.replay_tag.as_deref() else {
            return;
        };
        match self.get(tag) {
            Some(handler) => handler.on_replay(job, outcome).await,
            None => debug!("No replay handler for tag '{}' (job {})", tag, job.id),
        }
    }
}

/// Flushes the offline queue whenever connectivity is restored.
pub struct OfflineReplayer {
    queue: Arc<OfflineQueue>,
    runner: Arc<dyn JobRunner>,
}

impl OfflineReplayer {
    pub fn new(queue: Arc<OfflineQueue>, runner: Arc<dyn JobRunner>) -> Self {
        Self { queue, runner }
    }
}

#[async_trait]
impl ConnectivityListener for OfflineReplayer {
    fn name(&self) -> &str {
        "offline-replayer"
    }

    async fn on_network_restored(&self) {
        if self.queue.is_empty() {
            return;
        }
        let report = self.queue.flush(Arc::clone(&self.runner)).await;
        info!(
            "Replayed {} offline jobs after reconnect ({} failed)",
            report.attempted, report.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FerryError;
    use crate::network::ConnectivityMonitor;
    use crate::request::Request;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        outcomes: Mutex<Vec<(String, Option<u16>)>>,
    }

    #[async_trait]
    impl ReplayHandler for Collecting {
        async fn on_replay(&self, job: &OfflineJob, outcome: &Result<Response>) {
            let status = outcome.as_ref().ok().map(|r| r.status);
            self.outcomes.lock().unwrap().push((job.path.clone(), status));
        }
    }

    #[tokio::test]
    async fn test_deliver_routes_by_tag() {
        let registry = ReplayRegistry::new();
        let handler = Arc::new(Collecting::default());
        registry.register("comments", handler.clone());

        let tagged = OfflineJob::from_request(&Request::post("/comments")).with_replay_tag("comments");
        let untagged = OfflineJob::from_request(&Request::post("/likes"));
        let other = OfflineJob::from_request(&Request::post("/x")).with_replay_tag("unknown");

        registry.deliver(&tagged, &Ok(Response::new(201, ""))).await;
        registry.deliver(&untagged, &Ok(Response::new(201, ""))).await;
        registry
            .deliver(&other, &Err(FerryError::network("down")))
            .await;

        assert_eq!(
            *handler.outcomes.lock().unwrap(),
            vec![("/comments".to_string(), Some(201))]
        );
    }

    struct CountingRunner {
        runs: Mutex<usize>,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, _job: OfflineJob) -> Result<()> {
            *self.runs.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reconnect_flushes_queue() {
        let queue = Arc::new(OfflineQueue::new());
        queue.enqueue(OfflineJob::from_request(&Request::post("/a")));
        queue.enqueue(OfflineJob::from_request(&Request::post("/b")));
        let runner = Arc::new(CountingRunner {
            runs: Mutex::new(0),
        });

        let monitor = ConnectivityMonitor::new(false);
        monitor.add_listener(Arc::new(OfflineReplayer::new(Arc::clone(&queue), runner.clone())));

        monitor.set_online(true).unwrap().await.unwrap();
        assert_eq!(*runner.runs.lock().unwrap(), 2);
        assert!(queue.is_empty());
    }
}
