//! In-process run state repository.

use super::{RepositoryError, RunStateRepository};
use crate::context::RunContext;
use crate::fsm::PipelineState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::trace;
use uuid::Uuid;

/// Entry in the in-memory store.
struct StoredRun {
    snapshot: Vec<u8>,
    state: PipelineState,
    saved_at: Instant,
}

/// Keeps serialized snapshots in a concurrent map.
///
/// Snapshots go through JSON so a load behaves like one from a durable
/// store: the returned context is a fresh value with a fresh cancellation
/// flag. Entries older than the TTL, when one is set, are treated as absent.
pub struct InMemoryRunStateRepository {
    runs: DashMap<Uuid, StoredRun>,
    ttl: Option<Duration>,
}

impl InMemoryRunStateRepository {
    /// Creates a store whose entries never expire.
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
            ttl: None,
        }
    }

    /// Creates a store whose entries expire `ttl` after their last save.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            runs: DashMap::new(),
            ttl: Some(ttl),
        }
    }

    /// Number of stored runs, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.runs.len();
        self.runs.retain(|_, stored| !self.is_expired(stored));
        before - self.runs.len()
    }

    fn is_expired(&self, stored: &StoredRun) -> bool {
        self.ttl
            .is_some_and(|ttl| stored.saved_at.elapsed() >= ttl)
    }
}

impl Default for InMemoryRunStateRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStateRepository for InMemoryRunStateRepository {
    async fn save(&self, ctx: &RunContext) -> Result<(), RepositoryError> {
        let snapshot = serde_json::to_vec(ctx).map_err(|source| RepositoryError::Serialization {
            run_id: ctx.run_id(),
            source,
        })?;
        trace!(run_id = %ctx.run_id(), state = %ctx.current_state(), bytes = snapshot.len(), "Saving run snapshot");
        self.runs.insert(
            ctx.run_id(),
            StoredRun {
                snapshot,
                state: ctx.current_state(),
                saved_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunContext>, RepositoryError> {
        let Some(stored) = self.runs.get(&run_id) else {
            return Ok(None);
        };
        if self.is_expired(&stored) {
            drop(stored);
            self.runs.remove(&run_id);
            return Ok(None);
        }
        let ctx = serde_json::from_slice(&stored.snapshot)
            .map_err(|source| RepositoryError::Serialization { run_id, source })?;
        Ok(Some(ctx))
    }

    async fn delete(&self, run_id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.runs.remove(&run_id).is_some())
    }

    async fn list_active(&self) -> Result<Vec<Uuid>, RepositoryError> {
        Ok(self
            .runs
            .iter()
            .filter(|entry| !entry.state.is_terminal() && !self.is_expired(entry.value()))
            .map(|entry| *entry.key())
            .collect())
    }
}

impl std::fmt::Debug for InMemoryRunStateRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRunStateRepository")
            .field("runs", &self.runs.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
