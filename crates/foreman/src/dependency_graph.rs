//! Dependency Graph Index (C10): secondary index `dep_exec_id -> dependents`
//! for O(1) wake-up on completion (spec §4.5).

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// `dep_exec_id -> set(dependent_exec_ids)`.
#[derive(Default)]
pub struct DependencyGraph {
    dependents: RwLock<HashMap<String, HashSet<String>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `exec_id` as a dependent of every id in `dependencies`
    /// (called once, at Create).
    pub fn register(&self, exec_id: &str, dependencies: &[String]) {
        let mut dependents = self.dependents.write().unwrap();
        for dep in dependencies {
            dependents.entry(dep.clone()).or_default().insert(exec_id.to_string());
        }
    }

    pub fn dependents_of(&self, exec_id: &str) -> Vec<String> {
        self.dependents
            .read()
            .unwrap()
            .get(exec_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
