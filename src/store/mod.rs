//! Run state store: durable keyed storage of active runs with optimistic
//! versioning.
//!
//! A record exists exactly while its run is non-terminal. Every accepted
//! write bumps `version`; writes carry the version they read and fail with
//! [`StoreError::Conflict`] when another writer got there first.
//!
//! | Backend           | Notes                                             |
//! |-------------------|---------------------------------------------------|
//! | `MemoryRunStore`  | `DashMap`, per-key locking, process lifetime only |
//! | `SqliteRunStore`  | `rusqlite` on the blocking pool, bounded busy retry |

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};
use crate::errors::StoreError;
use crate::models::Run;

pub use memory::MemoryRunStore;
pub use sqlite::{BusyRetry, SqliteRunStore};

/// Mutation applied by [`RunStateStore::compare_and_update`].
///
/// Only `state` and `last_updated` are persisted from the mutated record.
pub type RunMutation = Box<dyn FnOnce(&mut Run) + Send + 'static>;

/// Contract shared by all run state store backends.
///
/// Operations on one `run_id` are linearizable with respect to each other;
/// different run ids never contend.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Look up an active run.
    async fn get(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    /// Insert a new run at version 1. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, run: Run) -> Result<Run, StoreError>;

    /// Apply `mutate` if the stored version still equals `expected_version`,
    /// persisting the result with the version incremented.
    async fn compare_and_update(
        &self,
        run_id: &str,
        expected_version: u64,
        mutate: RunMutation,
    ) -> Result<Run, StoreError>;

    /// Remove the run if the stored version still equals `expected_version`.
    async fn delete_if_version(&self, run_id: &str, expected_version: u64)
    -> Result<(), StoreError>;

    /// Number of active runs.
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Build the configured store backend.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn RunStateStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryRunStore::new())),
        StoreBackend::Sqlite => {
            if let Some(parent) = config.path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .context("Failed to create run store directory")?;
            }
            let store = SqliteRunStore::open(&config.path, config.busy_retry())
                .with_context(|| format!("Failed to open run store at {}", config.path.display()))?;
            Ok(Arc::new(store))
        }
    }
}
