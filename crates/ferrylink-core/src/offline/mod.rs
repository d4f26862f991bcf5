//! Deferred requests and their replay after reconnect.

mod job;
mod queue;
mod replay;
mod store;

pub use job::OfflineJob;
pub use queue::{FlushReport, JobRunner, OfflineQueue};
pub use replay::{OfflineReplayer, ReplayHandler, ReplayRegistry};
pub use store::OfflineQueueStore;
