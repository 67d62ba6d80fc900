//! Side effects run after a transition commits.

use crate::context::RunContext;
use std::sync::Arc;

type ActionFn = dyn Fn(&mut RunContext) -> Result<(), String> + Send + Sync;

/// A named side effect attached to a transition.
///
/// Actions run after the state change is committed. A failing action is
/// logged and does not roll the transition back.
#[derive(Clone)]
pub struct Action {
    name: String,
    apply: Arc<ActionFn>,
}

impl Action {
    /// Creates an action.
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut RunContext) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    /// Returns the action name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the action.
    pub fn apply(&self, ctx: &mut RunContext) -> Result<(), String> {
        (self.apply)(ctx)
    }

    /// `increment_retry`: counts the retry and clears the previous failure.
    #[must_use]
    pub fn increment_retry() -> Self {
        Self::new("increment_retry", |ctx| {
            ctx.increment_retry();
            ctx.clear_error();
            Ok(())
        })
    }

    /// `reset_run`: discards checkpoints, errors, timestamps and retries.
    #[must_use]
    pub fn reset_run() -> Self {
        Self::new("reset_run", |ctx| {
            ctx.reset_for_rerun();
            Ok(())
        })
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action").field("name", &self.name).finish()
    }
}
