//! Persistence of partial-transfer resume tokens.
//!
//! A token is written whenever a download fails after receiving data, so a
//! later call (possibly after a restart) can continue from the same byte
//! offset. Tokens are removed on success and on cancellation.

use crate::error::Result;
use crate::persist::{atomic_read_json, atomic_write_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Checkpoint of an interrupted download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub url: String,
    pub destination: PathBuf,
    /// File holding the bytes received so far.
    pub partial_path: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// `ETag`/`Last-Modified` of the partially received resource.
    #[serde(default)]
    pub validator: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResumeStoreData {
    tokens: Vec<ResumeToken>,
}

/// Stores resume tokens in `{state_dir}/resume_tokens.json`, one per URL.
pub struct ResumeStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl ResumeStore {
    pub const FILENAME: &'static str = "resume_tokens.json";

    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(Self::FILENAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace the token for `token.url`.
    pub fn save(&self, token: &ResumeToken) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = self.load_data();
        match data.tokens.iter_mut().find(|t| t.url == token.url) {
            Some(existing) => *existing = token.clone(),
            None => data.tokens.push(token.clone()),
        }
        debug!(
            "Saving resume token for {} at byte {}",
            token.url, token.bytes_downloaded
        );
        atomic_write_json(&self.path, &data)
    }

    pub fn remove(&self, url: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = self.load_data();
        let before = data.tokens.len();
        data.tokens.retain(|t| t.url != url);
        if data.tokens.len() < before {
            atomic_write_json(&self.path, &data)?;
        }
        Ok(())
    }

    pub fn get(&self, url: &str) -> Option<ResumeToken> {
        self.load_data().tokens.into_iter().find(|t| t.url == url)
    }

    pub fn load_all(&self) -> Vec<ResumeToken> {
        self.load_data().tokens
    }

    /// Read store data, returning empty on any error.
    fn load_data(&self) -> ResumeStoreData {
        match atomic_read_json::<ResumeStoreData>(&self.path) {
            Ok(Some(data)) => data,
            Ok(None) => ResumeStoreData::default(),
            Err(e) => {
                warn!(
                    "Failed to read resume tokens at {}: {}",
                    self.path.display(),
                    e
                );
                ResumeStoreData::default()
            }
        }
    }
}
