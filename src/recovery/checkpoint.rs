//! Wave checkpoints and the store contract.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable record of which tasks of a named wave have settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveCheckpoint {
    pub wave_id: String,
    pub wave_number: u32,
    pub completed_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl WaveCheckpoint {
    pub fn new(wave_id: impl Into<String>) -> Self {
        Self {
            wave_id: wave_id.into(),
            wave_number: 0,
            completed_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed_task_ids.iter().any(|id| id == task_id)
    }

    pub fn is_failed(&self, task_id: &str) -> bool {
        self.failed_task_ids.iter().any(|id| id == task_id)
    }

    pub fn record_success(&mut self, task_id: &str) {
        self.failed_task_ids.retain(|id| id != task_id);
        if !self.is_completed(task_id) {
            self.completed_task_ids.push(task_id.to_string());
        }
    }

    pub fn record_failure(&mut self, task_id: &str) {
        if !self.is_completed(task_id) && !self.is_failed(task_id) {
            self.failed_task_ids.push(task_id.to_string());
        }
    }

    /// Drop duplicate ids, keeping first occurrence order. An id present in
    /// both lists is treated as completed.
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.completed_task_ids.retain(|id| seen.insert(id.clone()));
        let completed = seen;
        let mut seen = HashSet::new();
        self.failed_task_ids
            .retain(|id| !completed.contains(id) && seen.insert(id.clone()));
    }
}

/// External durable storage for [`WaveCheckpoint`]s.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, wave_id: &str) -> anyhow::Result<Option<WaveCheckpoint>>;
    async fn save_checkpoint(&self, wave_id: &str, checkpoint: &WaveCheckpoint)
    -> anyhow::Result<()>;
}

/// Process-local store, useful for tests and single-process resumption.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, WaveCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: WaveCheckpoint) -> Self {
        let store = Self::default();
        if let Ok(mut map) = store.checkpoints.lock() {
            map.insert(checkpoint.wave_id.clone(), checkpoint);
        }
        store
    }

    pub fn get(&self, wave_id: &str) -> Option<WaveCheckpoint> {
        self.checkpoints.lock().ok()?.get(wave_id).cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load_checkpoint(&self, wave_id: &str) -> anyhow::Result<Option<WaveCheckpoint>> {
        let map = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        Ok(map.get(wave_id).cloned())
    }

    async fn save_checkpoint(
        &self,
        wave_id: &str,
        checkpoint: &WaveCheckpoint,
    ) -> anyhow::Result<()> {
        let mut map = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        map.insert(wave_id.to_string(), checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_dedupes_and_prefers_completed() {
        let mut cp = WaveCheckpoint::new("w");
        cp.completed_task_ids = ids(&["a", "b", "a"]);
        cp.failed_task_ids = ids(&["c", "b", "c", "d"]);
        cp.normalize();
        assert_eq!(cp.completed_task_ids, ids(&["a", "b"]));
        assert_eq!(cp.failed_task_ids, ids(&["c", "d"]));
    }

    #[test]
    fn success_supersedes_failure() {
        let mut cp = WaveCheckpoint::new("w");
        cp.record_failure("t1");
        cp.record_failure("t1");
        assert_eq!(cp.failed_task_ids, ids(&["t1"]));
        cp.record_success("t1");
        cp.record_success("t1");
        assert_eq!(cp.completed_task_ids, ids(&["t1"]));
        assert!(cp.failed_task_ids.is_empty());
        cp.record_failure("t1");
        assert!(cp.failed_task_ids.is_empty());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load_checkpoint("w").await.unwrap().is_none());

        let mut cp = WaveCheckpoint::new("w");
        cp.record_success("t1");
        store.save_checkpoint("w", &cp).await.unwrap();
        store.save_checkpoint("w", &cp).await.unwrap();

        let loaded = store.load_checkpoint("w").await.unwrap().unwrap();
        assert_eq!(loaded.completed_task_ids, ids(&["t1"]));
        assert_eq!(store.get("w"), Some(cp));
    }

    #[test]
    fn checkpoint_json_field_names() {
        let cp = WaveCheckpoint::new("nightly");
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["wave_id"], "nightly");
        assert!(json["completed_task_ids"].is_array());
        assert!(json["failed_task_ids"].is_array());
    }
}
