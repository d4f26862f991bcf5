//! Ferrylink - resilient HTTP client pipeline.
//!
//! This crate turns a logical [`Request`] into a network call with caching,
//! bearer-token refresh, bounded retry, offline deferral and resumable
//! downloads. Every collaborator is constructed explicitly and injected into
//! the [`RequestPipeline`]; there is no hidden global state.
//!
//! # Example
//!
//! ```rust,ignore
//! use ferrylink::{ClientConfig, Request, RequestPipeline};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Post {
//!     id: u32,
//!     title: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> ferrylink::Result<()> {
//!     let mut config = ClientConfig::default();
//!     config.base_url = Some("https://jsonplaceholder.typicode.com".into());
//!     let pipeline = RequestPipeline::from_config(config)?;
//!
//!     let post: Post = pipeline.request(Request::get("/posts/1")).await?;
//!     println!("{}: {}", post.id, post.title);
//!
//!     // Served from the cache, no network call.
//!     let _again: Post = pipeline.request(Request::get("/posts/1")).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod network;
pub mod offline;
pub mod request;

mod multipart;
mod persist;
mod pipeline;

// Re-export commonly used types
pub use auth::{HttpTokenRefresher, StaticTokenRefresher, TokenRefreshCoordinator, TokenRefresher};
pub use cache::{CacheConfig, CacheStore, PersistentStore, SqliteCache};
pub use cancel::{CancellationToken, CancelledError};
pub use config::ClientConfig;
pub use error::{FerryError, Result};
pub use interceptor::{HeaderInterceptor, Interceptor, InterceptorChain, LoggingInterceptor};
pub use multipart::MultipartForm;
pub use network::{
    ConnectivityMonitor, DownloadManager, DownloadProgress, DownloadStatus, ResumeToken,
    RetryConfig, RetryExecutor,
};
pub use offline::{OfflineJob, OfflineQueue, ReplayHandler};
pub use pipeline::{RequestOutcome, RequestPipeline, RequestPipelineBuilder};
pub use request::{HttpMethod, Request, Response};
