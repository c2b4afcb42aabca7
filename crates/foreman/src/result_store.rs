//! Result Store (C1): schema-validated result persistence with a bounded
//! in-memory cache in front of file storage (spec §4.8).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use md5::{Digest, Md5};
use serde_json::Value;
use tracing::warn;

use crate::error::ResultStoreError;
use crate::models::{ResultRecord, ResultSchema};
use crate::persistence::write_atomic;

/// A named function from one schema's shape to another's (spec §4.8).
pub type Transformer = Arc<dyn Fn(Value) -> Value + Send + Sync>;

fn hashed_filename(result_key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(result_key.as_bytes());
    format!("{:x}.json", hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
}

/// Schema-validated, disk-backed store of workflow/task results with a
/// bounded LRU-by-recency in-memory front.
pub struct ResultStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, ResultRecord>>,
    capacity: usize,
    schemas: RwLock<HashMap<String, ResultSchema>>,
    transformers: RwLock<HashMap<String, Transformer>>,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        let schemas = [
            ResultSchema::generic(),
            ResultSchema::containerized_workflow(),
            ResultSchema::dagger_pipeline(),
        ]
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();

        ResultStore {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            schemas: RwLock::new(schemas),
            transformers: RwLock::new(HashMap::new()),
        }
    }

    fn schema_for(&self, schema_id: &str) -> Result<ResultSchema, ResultStoreError> {
        self.schemas
            .read()
            .unwrap()
            .get(schema_id)
            .cloned()
            .ok_or_else(|| ResultStoreError::UnknownSchema(schema_id.to_string()))
    }

    /// Registers (or replaces) a pluggable schema beyond the three built-ins.
    pub fn register_schema(&self, schema: ResultSchema) {
        self.schemas.write().unwrap().insert(schema.id.clone(), schema);
    }

    /// Registers a named transformer from one schema's result shape to
    /// another's.
    pub fn register_transformer(&self, name: impl Into<String>, transformer: Transformer) {
        self.transformers.write().unwrap().insert(name.into(), transformer);
    }

    /// Applies a previously registered transformer by name.
    pub fn transform(&self, name: &str, payload: Value) -> Result<Value, ResultStoreError> {
        let transformer = self
            .transformers
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ResultStoreError::UnknownTransformer(name.to_string()))?;
        Ok(transformer(payload))
    }

    fn path_for(&self, result_key: &str) -> PathBuf {
        self.dir.join(hashed_filename(result_key))
    }

    fn evict_if_needed(&self, cache: &mut HashMap<String, ResultRecord>) {
        if cache.len() <= self.capacity {
            return;
        }
        if let Some(oldest_key) = cache
            .values()
            .min_by_key(|r| r.timestamp)
            .map(|r| ResultRecord::result_key(&r.workflow_id, r.task_id.as_deref()))
        {
            cache.remove(&oldest_key);
        }
    }

    /// `StoreResult`: validates and normalizes `payload` against `schema_id`,
    /// then persists and caches it.
    pub fn store_result(
        &self,
        workflow_id: &str,
        task_id: Option<&str>,
        schema_id: &str,
        payload: serde_json::Value,
    ) -> Result<ResultRecord, ResultStoreError> {
        let schema = self.schema_for(schema_id)?;
        schema.validate(&payload).map_err(ResultStoreError::InvalidResult)?;
        let normalized = schema.normalize(payload);

        let record = ResultRecord {
            workflow_id: workflow_id.to_string(),
            task_id: task_id.map(str::to_string),
            schema_id: schema_id.to_string(),
            payload: normalized,
            timestamp: chrono::Utc::now(),
        };

        let key = ResultRecord::result_key(workflow_id, task_id);
        if let Err(e) = write_atomic(&self.path_for(&key), &record) {
            warn!(key = %key, error = %e, "failed to persist result");
        }

        let mut cache = self.cache.write().unwrap();
        cache.insert(key, record.clone());
        self.evict_if_needed(&mut cache);
        Ok(record)
    }

    /// `GetResult`: in-memory hit first, falling back to disk.
    pub fn get_result(&self, workflow_id: &str, task_id: Option<&str>) -> Option<ResultRecord> {
        let key = ResultRecord::result_key(workflow_id, task_id);
        if let Some(record) = self.cache.read().unwrap().get(&key).cloned() {
            return Some(record);
        }

        let record: ResultRecord = std::fs::read_to_string(self.path_for(&key)).ok().and_then(|s| serde_json::from_str(&s).ok())?;
        let mut cache = self.cache.write().unwrap();
        cache.insert(key, record.clone());
        self.evict_if_needed(&mut cache);
        Some(record)
    }

    /// `DeleteResult`: removes both the cached and on-disk record.
    pub fn delete_result(&self, workflow_id: &str, task_id: Option<&str>) {
        let key = ResultRecord::result_key(workflow_id, task_id);
        self.cache.write().unwrap().remove(&key);
        let _ = std::fs::remove_file(self.path_for(&key));
    }

    pub fn clear_cache(&self) {
        self.cache.write().unwrap().clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats { size: self.cache.read().unwrap().len(), capacity: self.capacity }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
