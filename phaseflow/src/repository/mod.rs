//! Persistence of run snapshots.
//!
//! The coordinator only talks to [`RunStateRepository`]; the durable store
//! behind it is supplied by the embedding application.

mod memory;

pub use memory::InMemoryRunStateRepository;

use crate::context::RunContext;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Error raised by a run state repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The snapshot could not be encoded or decoded.
    #[error("Snapshot of run {run_id} could not be (de)serialized: {source}")]
    Serialization {
        /// The affected run.
        run_id: Uuid,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// The backing store failed.
    #[error("Run state backend error: {0}")]
    Backend(String),
}

/// Save/load/delete/list access to run snapshots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunStateRepository: Send + Sync {
    /// Stores a snapshot, replacing any previous one for the same run.
    async fn save(&self, ctx: &RunContext) -> Result<(), RepositoryError>;

    /// Loads the latest snapshot of a run.
    async fn load(&self, run_id: Uuid) -> Result<Option<RunContext>, RepositoryError>;

    /// Removes a run. Returns false if it was not stored.
    async fn delete(&self, run_id: Uuid) -> Result<bool, RepositoryError>;

    /// Lists runs whose latest snapshot is not in a terminal state.
    async fn list_active(&self) -> Result<Vec<Uuid>, RepositoryError>;
}
