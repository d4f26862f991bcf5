//! Download manager with progress tracking, cancellation and resume.
//!
//! Provides:
//! - Streaming into `<destination>.part`, then a move over the destination
//! - Progress reporting as a fraction in [0, 1]
//! - Cancellation that removes partial data and reports `Cancelled`
//! - Resume tokens persisted on failure, continued with a `Range` request
//!
//! Downloads are never retried automatically; resuming is up to the caller.

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{FerryError, Result};
use crate::network::resume_store::{ResumeStore, ResumeToken};
use crate::network::transport::DownloadTransport;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Finished,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Finished | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

/// Progress information for a download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    /// Bytes on disk so far, including any resumed prefix.
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<f64>,
}

impl DownloadProgress {
    fn new(bytes_downloaded: u64, total_bytes: Option<u64>, speed: f64) -> Self {
        let eta_seconds = total_bytes.and_then(|total| {
            if speed > 0.0 && bytes_downloaded < total {
                Some((total - bytes_downloaded) as f64 / speed)
            } else {
                None
            }
        });

        Self {
            bytes_downloaded,
            total_bytes,
            speed_bytes_per_sec: speed,
            eta_seconds,
        }
    }

    /// Completed fraction in [0, 1]; 0 when the total is unknown or zero.
    pub fn fraction(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;
pub type CompletionCallback = Box<dyn FnOnce(Result<PathBuf>) + Send>;

enum ProgressSink {
    None,
    Channel(mpsc::Sender<DownloadProgress>),
    Callback(ProgressCallback),
}

impl ProgressSink {
    async fn emit(&self, progress: DownloadProgress) {
        match self {
            ProgressSink::None => {}
            ProgressSink::Channel(tx) => {
                let _ = tx.send(progress).await;
            }
            ProgressSink::Callback(callback) => callback(progress),
        }
    }
}

/// What the server told us about the resource, kept for resume tokens.
#[derive(Default)]
struct TransferMeta {
    validator: Option<String>,
    total_bytes: Option<u64>,
}

struct Transfer {
    id: Uuid,
    url: String,
    destination: PathBuf,
    offset: u64,
    validator: Option<String>,
}

/// Handle to a download started with [`DownloadManager::start`].
pub struct DownloadHandle {
    id: Uuid,
    cancel: CancellationToken,
    statuses: Arc<RwLock<HashMap<Uuid, DownloadStatus>>>,
    task: JoinHandle<()>,
}

impl DownloadHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the transfer. Completion is invoked with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> DownloadStatus {
        read_status(&self.statuses, self.id).unwrap_or(DownloadStatus::Pending)
    }

    /// Wait until the transfer has finished and its completion has run.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Download task {} ended abnormally: {}", self.id, e);
        }
    }
}

fn read_status(
    statuses: &RwLock<HashMap<Uuid, DownloadStatus>>,
    id: Uuid,
) -> Option<DownloadStatus> {
    statuses
        .read()
        .map(|s| s.get(&id).copied())
        .unwrap_or_else(|e| e.into_inner().get(&id).copied())
}

/// Exclusive use of a destination path for the lifetime of one transfer.
struct DestinationClaim {
    active: Arc<Mutex<HashSet<PathBuf>>>,
    destination: PathBuf,
}

impl DestinationClaim {
    fn acquire(active: &Arc<Mutex<HashSet<PathBuf>>>, destination: &Path) -> Option<Self> {
        let mut set = active.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(destination.to_path_buf()) {
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
            destination: destination.to_path_buf(),
        })
    }
}

impl Drop for DestinationClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.destination);
    }
}

/// Download manager for file downloads.
#[derive(Clone)]
pub struct DownloadManager {
    transport: Arc<dyn DownloadTransport>,
    resume_store: Option<Arc<ResumeStore>>,
    statuses: Arc<RwLock<HashMap<Uuid, DownloadStatus>>>,
    /// Once this many transfers are tracked, finished ones are forgotten.
    status_capacity: usize,
    active: Arc<Mutex<HashSet<PathBuf>>>,
    progress_interval: Duration,
}

impl DownloadManager {
    /// Create a manager. Resume tokens are persisted under `state_dir` when
    /// one is given.
    pub fn new(transport: Arc<dyn DownloadTransport>, state_dir: Option<&Path>) -> Self {
        Self {
            transport,
            resume_store: state_dir.map(|dir| Arc::new(ResumeStore::new(dir))),
            statuses: Arc::new(RwLock::new(HashMap::new())),
            status_capacity: NetworkConfig::DOWNLOAD_STATUS_CAPACITY,
            active: Arc::new(Mutex::new(HashSet::new())),
            progress_interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
        }
    }

    pub fn with_status_capacity(mut self, capacity: usize) -> Self {
        self.status_capacity = capacity.max(1);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Path partial data is written to for `destination`.
    pub fn partial_path(destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_owned();
        name.push(NetworkConfig::DOWNLOAD_TEMP_SUFFIX);
        PathBuf::from(name)
    }

    pub fn status(&self, id: Uuid) -> Option<DownloadStatus> {
        read_status(&self.statuses, id)
    }

    /// Persisted resume token for `url`, if an earlier attempt left one.
    pub fn resume_token(&self, url: &str) -> Option<ResumeToken> {
        self.resume_store.as_ref().and_then(|store| store.get(url))
    }

    /// Download `url` to `destination` from byte zero.
    ///
    /// Returns the total number of bytes in the finished file.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let sink = match progress_tx {
            Some(tx) => ProgressSink::Channel(tx),
            None => ProgressSink::None,
        };
        let transfer = Transfer {
            id: Uuid::new_v4(),
            url: url.to_string(),
            destination: destination.to_path_buf(),
            offset: 0,
            validator: None,
        };
        self.run(transfer, &sink, cancel).await
    }

    /// Continue an interrupted download from its resume token.
    pub async fn download_resumed(
        &self,
        token: &ResumeToken,
        progress_tx: Option<mpsc::Sender<DownloadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let sink = match progress_tx {
            Some(tx) => ProgressSink::Channel(tx),
            None => ProgressSink::None,
        };
        let transfer = Self::transfer_from_token(Uuid::new_v4(), token).await;
        self.run(transfer, &sink, cancel).await
    }

    /// Start a download in the background.
    pub fn start(
        &self,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        on_progress: ProgressCallback,
        on_complete: CompletionCallback,
    ) -> DownloadHandle {
        let url = url.into();
        let destination = destination.into();
        self.spawn(on_progress, on_complete, move |id| async move {
            Transfer {
                id,
                url,
                destination,
                offset: 0,
                validator: None,
            }
        })
    }

    /// Resume an interrupted download in the background.
    pub fn resume(
        &self,
        token: ResumeToken,
        on_progress: ProgressCallback,
        on_complete: CompletionCallback,
    ) -> DownloadHandle {
        self.spawn(on_progress, on_complete, move |id| async move {
            Self::transfer_from_token(id, &token).await
        })
    }

    fn spawn<F, Fut>(
        &self,
        on_progress: ProgressCallback,
        on_complete: CompletionCallback,
        prepare: F,
    ) -> DownloadHandle
    where
        F: FnOnce(Uuid) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Transfer> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.set_status(id, DownloadStatus::Pending);

        let manager = self.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let transfer = prepare(id).await;
            let destination = transfer.destination.clone();
            let sink = ProgressSink::Callback(on_progress);
            let result = manager.run(transfer, &sink, &task_cancel).await;
            on_complete(result.map(|_| destination));
        });

        DownloadHandle {
            id,
            cancel,
            statuses: Arc::clone(&self.statuses),
            task,
        }
    }

    async fn transfer_from_token(id: Uuid, token: &ResumeToken) -> Transfer {
        // The partial file is the source of truth for how much we have.
        let on_disk = tokio::fs::metadata(&token.partial_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if on_disk != token.bytes_downloaded {
            debug!(
                "Resume token for {} says {} bytes, partial file has {}",
                token.url, token.bytes_downloaded, on_disk
            );
        }
        Transfer {
            id,
            url: token.url.clone(),
            destination: token.destination.clone(),
            offset: on_disk,
            validator: token.validator.clone(),
        }
    }

    fn set_status(&self, id: Uuid, status: DownloadStatus) {
        let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        if !statuses.contains_key(&id) && statuses.len() >= self.status_capacity {
            let before = statuses.len();
            statuses.retain(|_, s| !s.is_terminal());
            debug!("Forgot {} finished downloads", before - statuses.len());
        }
        statuses.insert(id, status);
    }

    /// Run a transfer to completion and settle its status and resume token.
    async fn run(
        &self,
        transfer: Transfer,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let id = transfer.id;
        let url = transfer.url.as_str();
        let destination = transfer.destination.as_path();
        let partial = Self::partial_path(destination);

        let Some(_claim) = DestinationClaim::acquire(&self.active, destination) else {
            self.set_status(id, DownloadStatus::Failed);
            warn!("{} is already being downloaded to", destination.display());
            return Err(FerryError::InvalidRequest {
                message: format!(
                    "A download to {} is already in progress",
                    destination.display()
                ),
            });
        };
        self.set_status(id, DownloadStatus::Pending);

        let mut meta = TransferMeta::default();
        let result = self
            .transfer(&transfer, &partial, sink, cancel, &mut meta)
            .await;

        match &result {
            Ok(bytes) => {
                self.set_status(id, DownloadStatus::Finished);
                self.forget_token(url);
                info!("Downloaded {} bytes to {}", bytes, destination.display());
            }
            Err(FerryError::Cancelled) => {
                self.set_status(id, DownloadStatus::Cancelled);
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove {}: {}", partial.display(), e);
                    }
                }
                self.forget_token(url);
                info!("Download of {} cancelled", url);
            }
            Err(e) => {
                self.set_status(id, DownloadStatus::Failed);
                warn!("Download of {} failed: {}", url, e);
                self.remember_token(url, destination, &partial, &meta).await;
            }
        }

        result
    }

    async fn transfer(
        &self,
        transfer: &Transfer,
        partial: &Path,
        sink: &ProgressSink,
        cancel: &CancellationToken,
        meta: &mut TransferMeta,
    ) -> Result<u64> {
        cancel.check()?;

        if let Some(parent) = transfer.destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| FerryError::Io {
                message: format!("Failed to create directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let offset = transfer.offset;
        if offset > 0 {
            info!("Resuming download of {} from byte {}", transfer.url, offset);
        }

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FerryError::Cancelled),
            opened = self.transport.open(&transfer.url, offset, transfer.validator.as_deref()) => opened?,
        };
        self.set_status(transfer.id, DownloadStatus::Downloading);

        let resuming = offset > 0 && stream.is_partial();
        if offset > 0 && !resuming {
            warn!("Server does not support Range requests, restarting from zero");
        }

        let total_bytes = if resuming {
            stream
                .total_size
                .or_else(|| stream.content_length.map(|len| len + offset))
        } else {
            stream.content_length.or(stream.total_size)
        };
        meta.total_bytes = total_bytes;
        meta.validator = stream.validator.clone().or_else(|| transfer.validator.clone());

        let mut file = if resuming {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial)
                .await
                .map_err(|e| FerryError::io_with_path(e, partial))?
        } else {
            tokio::fs::File::create(partial)
                .await
                .map_err(|e| FerryError::io_with_path(e, partial))?
        };

        let mut downloaded: u64 = if resuming { offset } else { 0 };
        let mut last_progress_update = Instant::now();
        let mut speed_tracker = SpeedTracker::new();

        sink.emit(DownloadProgress::new(downloaded, total_bytes, 0.0))
            .await;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drop(file);
                    return Err(FerryError::Cancelled);
                }
                next = stream.body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    file.flush().await.map_err(|err| FerryError::io_with_path(err, partial))?;
                    return Err(e);
                }
                None => break,
            };

            file.write_all(&chunk).await.map_err(|e| FerryError::Io {
                message: format!("Failed to write to temp file: {}", e),
                path: Some(partial.to_path_buf()),
                source: Some(e),
            })?;

            downloaded += chunk.len() as u64;
            speed_tracker.record(chunk.len() as u64);

            if last_progress_update.elapsed() >= self.progress_interval {
                let progress =
                    DownloadProgress::new(downloaded, total_bytes, speed_tracker.speed());
                sink.emit(progress).await;
                last_progress_update = Instant::now();
            }
        }

        file.flush().await.map_err(|e| FerryError::Io {
            message: format!("Failed to flush temp file: {}", e),
            path: Some(partial.to_path_buf()),
            source: Some(e),
        })?;
        file.sync_all()
            .await
            .map_err(|e| FerryError::io_with_path(e, partial))?;
        drop(file);

        if let Some(total) = total_bytes {
            if downloaded != total {
                return Err(FerryError::Network {
                    message: format!("Incomplete download: got {} of {} bytes", downloaded, total),
                    cause: None,
                });
            }
        }

        move_into_place(partial, &transfer.destination).await?;

        sink.emit(DownloadProgress::new(
            downloaded,
            total_bytes.or(Some(downloaded)),
            speed_tracker.speed(),
        ))
        .await;

        Ok(downloaded)
    }

    async fn remember_token(&self, url: &str, destination: &Path, partial: &Path, meta: &TransferMeta) {
        let Some(store) = &self.resume_store else {
            return;
        };
        let bytes_downloaded = match tokio::fs::metadata(partial).await {
            Ok(m) if m.len() > 0 => m.len(),
            _ => return,
        };

        let token = ResumeToken {
            url: url.to_string(),
            destination: destination.to_path_buf(),
            partial_path: partial.to_path_buf(),
            bytes_downloaded,
            total_bytes: meta.total_bytes,
            validator: meta.validator.clone(),
            updated_at: Utc::now(),
        };
        if let Err(e) = store.save(&token) {
            warn!("Failed to persist resume token for {}: {}", url, e);
        }
    }

    fn forget_token(&self, url: &str) {
        if let Some(store) = &self.resume_store {
            if let Err(e) = store.remove(url) {
                warn!("Failed to remove resume token for {}: {}", url, e);
            }
        }
    }
}

/// Move the finished payload over `destination`, replacing any existing file.
async fn move_into_place(partial: &Path, destination: &Path) -> Result<()> {
    if tokio::fs::rename(partial, destination).await.is_ok() {
        return Ok(());
    }

    // Some platforms refuse to rename over an existing file.
    if tokio::fs::metadata(destination).await.is_ok() {
        tokio::fs::remove_file(destination)
            .await
            .map_err(|e| FerryError::io_with_path(e, destination))?;
    }
    tokio::fs::rename(partial, destination)
        .await
        .map_err(|e| FerryError::Io {
            message: format!("Failed to move download to final destination: {}", e),
            path: Some(destination.to_path_buf()),
            source: Some(e),
        })
}

/// Simple speed tracker for download progress.
struct SpeedTracker {
    start_time: Instant,
    total_bytes: u64,
}

impl SpeedTracker {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes: 0,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.total_bytes += bytes;
    }

    fn speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_bytes as f64 / elapsed
        } else {
            0.0
        }
    }
}
