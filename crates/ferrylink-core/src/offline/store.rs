//! Durable copy of the offline queue.

use super::job::OfflineJob;
use crate::error::{FerryError, Result};
use crate::persist::{atomic_read_json, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    jobs: Vec<OfflineJob>,
}

/// Reads and atomically rewrites the queue's JSON file.
#[derive(Debug, Clone)]
pub struct OfflineQueueStore {
    path: PathBuf,
}

impl OfflineQueueStore {
    pub const VERSION: u32 = 1;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Jobs saved by a previous process, oldest first. A missing file is an
    /// empty queue.
    pub fn load(&self) -> Result<Vec<OfflineJob>> {
        match atomic_read_json::<QueueFile>(&self.path)? {
            None => Ok(Vec::new()),
            Some(file) if file.version > Self::VERSION => Err(FerryError::Config {
                message: format!(
                    "Offline queue {} has unsupported version {}",
                    self.path.display(),
                    file.version
                ),
            }),
            Some(file) => {
                debug!("Loaded {} offline jobs from {}", file.jobs.len(), self.path.display());
                Ok(file.jobs)
            }
        }
    }

    pub fn save(&self, jobs: &[OfflineJob]) -> Result<()> {
        atomic_write_json(
            &self.path,
            &QueueFile {
                version: Self::VERSION,
                jobs: jobs.to_vec(),
            },
        )
    }
}
