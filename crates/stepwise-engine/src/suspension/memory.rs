use std::collections::HashMap;
use std::sync::RwLock;

use tracing::info;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::RunId;

use super::{SuspendedRun, SuspensionStore};

/// Suspended runs kept in process memory. Lost on restart.
#[derive(Debug, Default)]
pub struct MemorySuspensionStore {
    runs: RwLock<HashMap<RunId, SuspendedRun>>,
}

impl MemorySuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SuspensionStore for MemorySuspensionStore {
    fn save(&self, run: &SuspendedRun) -> Result<()> {
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.run_id.clone(), run.clone());
        info!(run_id = %run.run_id, node_id = %run.cursor, "Run suspended");
        Ok(())
    }

    fn take(&self, run_id: &RunId) -> Result<SuspendedRun> {
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id)
            .ok_or_else(|| StepwiseError::RunNotFound(run_id.to_string()))
    }

    fn get(&self, run_id: &RunId) -> Result<Option<SuspendedRun>> {
        Ok(self
            .runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<SuspendedRun>> {
        let mut runs: Vec<SuspendedRun> = self
            .runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.suspended_at);
        Ok(runs)
    }

    fn remove(&self, run_id: &RunId) -> Result<bool> {
        Ok(self
            .runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspension::sample_run;
    use chrono::{Duration, Utc};

    #[test]
    fn test_save_and_take() {
        let store = MemorySuspensionStore::new();
        store.save(&sample_run("r1", None)).unwrap();
        assert_eq!(store.len(), 1);

        let run = store.take(&RunId::from_string("r1")).unwrap();
        assert_eq!(run.cursor, "approve");
        assert!(store.is_empty());
    }

    #[test]
    fn test_take_twice_is_not_found() {
        let store = MemorySuspensionStore::new();
        store.save(&sample_run("r1", None)).unwrap();
        store.take(&RunId::from_string("r1")).unwrap();
        let err = store.take(&RunId::from_string("r1")).unwrap_err();
        assert!(matches!(err, StepwiseError::RunNotFound(id) if id == "r1"));
    }

    #[test]
    fn test_expired_filter() {
        let store = MemorySuspensionStore::new();
        let now = Utc::now();
        store.save(&sample_run("old", Some(now - Duration::seconds(5)))).unwrap();
        store.save(&sample_run("fresh", Some(now + Duration::hours(1)))).unwrap();
        store.save(&sample_run("forever", None)).unwrap();

        let expired = store.expired(now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].run_id.as_str(), "old");
        assert_eq!(store.list().unwrap().len(), 3);
    }

    #[test]
    fn test_remove() {
        let store = MemorySuspensionStore::new();
        store.save(&sample_run("r1", None)).unwrap();
        assert!(store.remove(&RunId::from_string("r1")).unwrap());
        assert!(!store.remove(&RunId::from_string("r1")).unwrap());
        assert!(store.get(&RunId::from_string("r1")).unwrap().is_none());
    }
}
