//! Stage implementations keyed by name.

use crate::stages::{Stage, StageExecutor, StageRunner};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of stage runners, looked up by the configured stage name.
#[derive(Default)]
pub struct StageRegistry {
    runners: RwLock<HashMap<String, Arc<dyn StageRunner>>>,
}

impl StageRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a runner under its own name, replacing any previous one.
    pub fn register(&self, runner: Arc<dyn StageRunner>) {
        let name = runner.name().to_string();
        self.runners.write().insert(name, runner);
    }

    /// Registers a runner under an explicit name.
    pub fn register_as(&self, name: impl Into<String>, runner: Arc<dyn StageRunner>) {
        self.runners.write().insert(name.into(), runner);
    }

    /// Wraps a typed stage in a [`StageExecutor`] and registers it.
    pub fn register_stage<S: Stage + 'static>(&self, stage: S) {
        self.register(StageExecutor::shared(stage));
    }

    /// Builder form of [`StageRegistry::register_stage`].
    #[must_use]
    pub fn with_stage<S: Stage + 'static>(self, stage: S) -> Self {
        self.register_stage(stage);
        self
    }

    /// Looks up a runner.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn StageRunner>> {
        self.runners.read().get(name).cloned()
    }

    /// Returns true if a runner is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.runners.read().contains_key(name)
    }

    /// Removes a runner.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn StageRunner>> {
        self.runners.write().remove(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered runners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runners.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runners.read().is_empty()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}
