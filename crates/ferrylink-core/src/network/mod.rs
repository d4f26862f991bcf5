//! Network layer: transports, retries, connectivity and downloads.
//!
//! This module provides:
//! - The `Transport`/`DownloadTransport` seams and a reqwest implementation
//! - Bounded exponential-backoff retry
//! - Connectivity tracking with restore notifications
//! - Resumable downloads with progress tracking

mod connectivity;
mod download;
mod resume_store;
mod retry;
mod transport;

pub use connectivity::{ConnectivityConfig, ConnectivityListener, ConnectivityMonitor};
pub use download::{
    CompletionCallback, DownloadHandle, DownloadManager, DownloadProgress, DownloadStatus,
    ProgressCallback,
};
pub use resume_store::{ResumeStore, ResumeToken};
pub use retry::{RetryConfig, RetryExecutor, RetryStats};
pub use transport::{
    parse_content_range_total, DownloadStream, DownloadTransport, ReqwestTransport, Transport,
};
