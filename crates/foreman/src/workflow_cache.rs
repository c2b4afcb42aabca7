//! Workflow Cache (C2): content-addressed result memoization keyed by
//! `sha256(task_id, workflow_type, canonical_json(params))` (spec §4.9,
//! redesigned from the source's MD5-over-params-only key — see DESIGN.md).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::CacheError;
use crate::models::CacheEntry;
use crate::persistence::write_atomic;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
}

fn cache_key(task_id: &str, workflow_type: &str, params: &HashMap<String, Value>) -> String {
    let sorted: std::collections::BTreeMap<&String, &Value> = params.iter().collect();
    let canonical = serde_json::to_string(&sorted).expect("maps of JSON values always serialize");

    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(b"_");
    hasher.update(workflow_type.as_bytes());
    hasher.update(b"_");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// TTL-bounded, file-backed cache of prior workflow results.
pub struct WorkflowCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    dir: PathBuf,
    ttl_seconds: u64,
}

impl WorkflowCache {
    pub fn new(dir: impl Into<PathBuf>, ttl_seconds: u64) -> Self {
        WorkflowCache { entries: RwLock::new(HashMap::new()), dir: dir.into(), ttl_seconds }
    }

    /// Loads every `*.json` entry already on disk into memory, skipping (and
    /// logging) any record that doesn't parse — a corrupt cache entry is
    /// never fatal, it is simply a miss (spec §4.9).
    pub fn load(dir: impl Into<PathBuf>, ttl_seconds: u64) -> std::io::Result<Self> {
        let dir = dir.into();
        let mut entries = HashMap::new();
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path).ok().and_then(|s| serde_json::from_str::<CacheEntry>(&s).ok()) {
                    Some(cached) => {
                        entries.insert(cached.key.clone(), cached);
                    }
                    None => warn!(path = %path.display(), "skipping unreadable cache entry"),
                }
            }
        }
        Ok(WorkflowCache { entries: RwLock::new(entries), dir, ttl_seconds })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn persist(&self, entry: &CacheEntry) {
        if let Err(e) = write_atomic(&self.path_for(&entry.key), entry) {
            warn!(key = %entry.key, error = %e, "failed to persist cache entry");
        }
    }

    /// `Get`: returns the cached value, or `None` on a miss or expiry (an
    /// expired entry is evicted from memory, not re-read from disk).
    pub fn get(&self, task_id: &str, workflow_type: &str, params: &HashMap<String, Value>) -> Option<Value> {
        let key = cache_key(task_id, workflow_type, params);
        let mut entries = self.entries.write().unwrap();
        match entries.get(&key) {
            Some(entry) if !entry.is_expired(self.ttl_seconds, Utc::now()) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// `Set`: stores a value under the content-addressed key, overwriting any
    /// prior entry.
    pub fn set(
        &self,
        task_id: &str,
        workflow_type: &str,
        params: &HashMap<String, Value>,
        value: Value,
    ) -> Result<(), CacheError> {
        let key = cache_key(task_id, workflow_type, params);
        let entry = CacheEntry { key: key.clone(), value, stored_at: Utc::now() };
        self.persist(&entry);
        self.entries.write().unwrap().insert(key, entry);
        Ok(())
    }

    /// `Delete`: removes one entry by its derived key, if present.
    pub fn delete(&self, task_id: &str, workflow_type: &str, params: &HashMap<String, Value>) {
        let key = cache_key(task_id, workflow_type, params);
        if self.entries.write().unwrap().remove(&key).is_some() {
            let _ = std::fs::remove_file(self.path_for(&key));
        }
    }

    /// `Clear`: drops every entry, in memory and on disk.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap();
        for key in entries.keys() {
            let _ = std::fs::remove_file(self.path_for(key));
        }
        entries.clear();
    }

    /// `All`: every non-expired entry currently cached.
    pub fn all(&self) -> Vec<CacheEntry> {
        let now = Utc::now();
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| !e.is_expired(self.ttl_seconds, now))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { size: self.entries.read().unwrap().len() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params() -> HashMap<String, Value> {
        HashMap::from([("a".to_string(), Value::from(1)), ("b".to_string(), Value::from("x"))])
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let cache = WorkflowCache::new(dir.path(), 3600);
        cache.set("t1", "generic", &params(), serde_json::json!({"ok": true})).unwrap();
        assert_eq!(cache.get("t1", "generic", &params()), Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn different_param_order_hashes_to_same_key() {
        let dir = tempdir().unwrap();
        let cache = WorkflowCache::new(dir.path(), 3600);
        cache.set("t1", "generic", &params(), serde_json::json!(1)).unwrap();

        let mut reordered = HashMap::new();
        reordered.insert("b".to_string(), Value::from("x"));
        reordered.insert("a".to_string(), Value::from(1));
        assert_eq!(cache.get("t1", "generic", &reordered), Some(serde_json::json!(1)));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let cache = WorkflowCache::new(dir.path(), 0);
        cache.set("t1", "generic", &params(), serde_json::json!(1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(cache.get("t1", "generic", &params()), None);
    }

    #[test]
    fn delete_removes_entry() {
        let dir = tempdir().unwrap();
        let cache = WorkflowCache::new(dir.path(), 3600);
        cache.set("t1", "generic", &params(), serde_json::json!(1)).unwrap();
        cache.delete("t1", "generic", &params());
        assert_eq!(cache.get("t1", "generic", &params()), None);
    }

    #[test]
    fn clear_empties_the_cache() {
        let dir = tempdir().unwrap();
        let cache = WorkflowCache::new(dir.path(), 3600);
        cache.set("t1", "generic", &params(), serde_json::json!(1)).unwrap();
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn load_restores_persisted_entries() {
        let dir = tempdir().unwrap();
        {
            let cache = WorkflowCache::new(dir.path(), 3600);
            cache.set("t1", "generic", &params(), serde_json::json!({"v": 1})).unwrap();
        }
        let reloaded = WorkflowCache::load(dir.path(), 3600).unwrap();
        assert_eq!(reloaded.get("t1", "generic", &params()), Some(serde_json::json!({"v": 1})));
    }
}
