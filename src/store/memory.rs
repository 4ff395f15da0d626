use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{RunMutation, RunStateStore};
use crate::errors::StoreError;
use crate::models::Run;

/// In-process run store. Each key is guarded by its `DashMap` shard lock, so
/// read-check-write on one run is atomic while other runs proceed freely.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: DashMap<String, Run>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStore {
    async fn get(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.runs.get(run_id).map(|entry| entry.value().clone()))
    }

    async fn create(&self, mut run: Run) -> Result<Run, StoreError> {
        match self.runs.entry(run.run_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists { run_id: run.run_id }),
            Entry::Vacant(slot) => {
                run.version = 1;
                slot.insert(run.clone());
                Ok(run)
            }
        }
    }

    async fn compare_and_update(
        &self,
        run_id: &str,
        expected_version: u64,
        mutate: RunMutation,
    ) -> Result<Run, StoreError> {
        let Some(mut stored) = self.runs.get_mut(run_id) else {
            return Err(StoreError::Conflict {
                run_id: run_id.to_string(),
                expected: expected_version,
                found: None,
            });
        };
        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                run_id: run_id.to_string(),
                expected: expected_version,
                found: Some(stored.version),
            });
        }

        let mut draft = stored.clone();
        mutate(&mut draft);
        stored.state = draft.state;
        stored.last_updated = draft.last_updated;
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn delete_if_version(
        &self,
        run_id: &str,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        if self
            .runs
            .remove_if(run_id, |_, run| run.version == expected_version)
            .is_some()
        {
            return Ok(());
        }
        Err(StoreError::Conflict {
            run_id: run_id.to_string(),
            expected: expected_version,
            found: self.runs.get(run_id).map(|entry| entry.version),
        })
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.runs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineParams, RunState};
    use chrono::Utc;

    fn queued(run_id: &str) -> Run {
        Run {
            run_id: run_id.to_string(),
            workflow_url: "https://example.com/main.nf".into(),
            workflow_type: "NEXTFLOW".into(),
            workflow_type_version: "23.04".into(),
            params_blob: "{}".into(),
            engine_params: EngineParams::default(),
            state: RunState::Queued,
            last_updated: Utc::now(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_version_one() {
        let store = MemoryRunStore::new();
        let run = store.create(queued("a")).await.unwrap();
        assert_eq!(run.version, 1);
        assert_eq!(store.get("a").await.unwrap(), Some(run));
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = MemoryRunStore::new();
        store.create(queued("a")).await.unwrap();
        let err = store.create(queued("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_compare_and_update_bumps_version() {
        let store = MemoryRunStore::new();
        store.create(queued("a")).await.unwrap();
        let updated = store
            .compare_and_update("a", 1, Box::new(|run| run.state = RunState::Initializing))
            .await
            .unwrap();
        assert_eq!(updated.state, RunState::Initializing);
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_without_applying() {
        let store = MemoryRunStore::new();
        store.create(queued("a")).await.unwrap();
        store
            .compare_and_update("a", 1, Box::new(|run| run.state = RunState::Initializing))
            .await
            .unwrap();

        let err = store
            .compare_and_update("a", 1, Box::new(|run| run.state = RunState::Canceled))
            .await
            .unwrap_err();
        match err {
            StoreError::Conflict {
                expected, found, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(found, Some(2));
            }
            other => panic!("Expected Conflict, got {other:?}"),
        }
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Initializing);
    }

    #[tokio::test]
    async fn test_descriptive_fields_are_immutable() {
        let store = MemoryRunStore::new();
        store.create(queued("a")).await.unwrap();
        let updated = store
            .compare_and_update(
                "a",
                1,
                Box::new(|run| {
                    run.workflow_url = "changed".into();
                    run.state = RunState::Initializing;
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.workflow_url, "https://example.com/main.nf");
    }

    #[tokio::test]
    async fn test_delete_if_version() {
        let store = MemoryRunStore::new();
        store.create(queued("a")).await.unwrap();

        let err = store.delete_if_version("a", 7).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: Some(1), .. }));
        assert_eq!(store.count().await.unwrap(), 1);

        store.delete_if_version("a", 1).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);

        let err = store.delete_if_version("a", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: None, .. }));
    }
}
