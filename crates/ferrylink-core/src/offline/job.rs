//! Serializable descriptor of a deferred request.

use crate::request::{HttpMethod, Request};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A logical request parked until connectivity returns.
///
/// Jobs hold the request itself rather than a closure so the queue can be
/// written to disk and rebuilt after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineJob {
    pub id: Uuid,
    pub method: HttpMethod,
    pub path: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// Selects the replay handler that receives this job's outcome.
    #[serde(default)]
    pub replay_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Number of replays attempted so far.
    #[serde(default)]
    pub attempts: u32,
}

impl OfflineJob {
    pub fn from_request(request: &Request) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: request.method(),
            path: request.path().to_string(),
            query: request.query().to_vec(),
            headers: request.headers().clone(),
            body: request.body().map(|b| b.to_vec()),
            replay_tag: None,
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn with_replay_tag(mut self, tag: impl Into<String>) -> Self {
        self.replay_tag = Some(tag.into());
        self
    }

    /// Rebuild the request. Replays never read from or write to the cache.
    pub fn to_request(&self) -> Request {
        let mut request = Request::new(self.path.as_str(), self.method).with_cache(false);
        for (name, value) in &self.query {
            request = request.with_query(name.as_str(), value.as_str());
        }
        for (name, value) in &self.headers {
            request = request.with_header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.body {
            request = request.with_body(body.clone());
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_survives_json() {
        let request = Request::post("/comments")
            .with_query("draft", "1")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"text":"hi"}"#);
        let job = OfflineJob::from_request(&request).with_replay_tag("comments");

        let json = serde_json::to_string(&job).unwrap();
        let restored: OfflineJob = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, job);

        let rebuilt = restored.to_request();
        assert_eq!(rebuilt.method(), HttpMethod::Post);
        assert_eq!(rebuilt.path(), "/comments");
        assert_eq!(rebuilt.query(), request.query());
        assert_eq!(rebuilt.header("content-type"), Some("application/json"));
        assert_eq!(rebuilt.body(), request.body());
        assert!(!rebuilt.is_cacheable());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{
            "id": "7d0c3c1e-5b7a-4f53-9a57-2f1f6f3f9e01",
            "method": "DELETE",
            "path": "/posts/9",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let job: OfflineJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.method, HttpMethod::Delete);
        assert!(job.query.is_empty());
        assert_eq!(job.attempts, 0);
        assert!(job.replay_tag.is_none());
    }
}
