use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in the Workflow Cache (C2), keyed by a content hash of
/// `(task_id, workflow_type, params)` — see `crate::workflow_cache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, ttl_seconds: u64, now: DateTime<Utc>) -> bool {
        let expires_at = self.stored_at + chrono::Duration::seconds(ttl_seconds as i64);
        now >= expires_at
    }
}
