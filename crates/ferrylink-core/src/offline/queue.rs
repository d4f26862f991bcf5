//! FIFO queue of deferred requests.
//!
//! `flush` drains the whole queue in one step and runs the drained jobs
//! concurrently. A job that re-enqueues itself while running lands in the
//! fresh queue and waits for the next flush.

use super::job::OfflineJob;
use super::store::OfflineQueueStore;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Executes one replayed job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: OfflineJob) -> Result<()>;
}

/// Tally of one `flush` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct OfflineQueue {
    jobs: Mutex<VecDeque<OfflineJob>>,
    store: Option<OfflineQueueStore>,
    /// Keeps file writes in the same order as the snapshots they persist.
    persist_lock: Mutex<()>,
}

impl OfflineQueue {
    /// In-memory queue.
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            store: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Queue mirrored to `store`, starting with whatever it holds.
    pub fn with_store(store: OfflineQueueStore) -> Self {
        let restored = match store.load() {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    info!("Restored {} offline jobs from {}", jobs.len(), store.path().display());
                }
                jobs
            }
            Err(e) => {
                warn!("Failed to restore offline queue, starting empty: {}", e);
                Vec::new()
            }
        };
        Self {
            jobs: Mutex::new(restored.into()),
            store: Some(store),
            persist_lock: Mutex::new(()),
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, VecDeque<OfflineJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a job. Never fails: if the file can't be written the job is
    /// still held for this process.
    pub fn enqueue(&self, job: OfflineJob) {
        debug!("Enqueued offline job {} {} {}", job.id, job.method, job.path);
        self.lock_jobs().push_back(job);
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_jobs().is_empty()
    }

    pub fn snapshot(&self) -> Vec<OfflineJob> {
        self.lock_jobs().iter().cloned().collect()
    }

    pub fn store(&self) -> Option<&OfflineQueueStore> {
        self.store.as_ref()
    }

    /// Drain the queue and run every drained job concurrently.
    pub async fn flush(&self, runner: Arc<dyn JobRunner>) -> FlushReport {
        let drained: Vec<OfflineJob> = self.lock_jobs().drain(..).collect();
        if drained.is_empty() {
            return FlushReport::default();
        }
        self.persist();
        info!("Flushing {} offline jobs", drained.len());

        let tasks = drained.into_iter().map(|mut job| {
            job.attempts += 1;
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                let id = job.id;
                (id, runner.run(job).await)
            })
        });

        let mut report = FlushReport::default();
        for joined in futures::future::join_all(tasks).await {
            report.attempted += 1;
            match joined {
                Ok((_, Ok(()))) => report.succeeded += 1,
                Ok((id, Err(e))) => {
                    warn!("Offline job {} failed: {}", id, e);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Offline job task aborted: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Offline flush finished: {} succeeded, {} failed, {} still queued",
            report.succeeded,
            report.failed,
            self.len()
        );
        report
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = self.snapshot();
        if let Err(e) = store.save(&snapshot) {
            warn!("Failed to persist offline queue to {}: {}", store.path().display(), e);
        }
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}
