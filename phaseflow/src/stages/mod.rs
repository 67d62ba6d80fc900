//! Stage trait and implementations.
//!
//! A stage is one independently implemented unit of work. Implementors write
//! a typed [`Stage`]; the coordinator talks to the object-safe
//! [`StageRunner`] that [`StageExecutor`] derives from it.

mod error;
mod executor;
mod fn_stage;
mod resource;
mod status;

pub use error::StageError;
pub use executor::StageExecutor;
pub use fn_stage::FnStage;
pub use resource::{ResourceClient, ResourceReply};
pub use status::{StageMetrics, StageStatus};

use crate::context::{ExecutionContext, StageScope};
use crate::messages::{Request, Response};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed pipeline stage.
///
/// Only `name` and `process` are required. The hooks default to no-ops; a
/// failing `on_start` or `on_complete` fails the invocation like an error
/// from `process` does.
#[async_trait]
pub trait Stage: Send + Sync {
    /// What the request payload is parsed into.
    type Input: DeserializeOwned + Send;
    /// What `process` produces; serialized into the response payload.
    type Output: Serialize + Send + Sync;

    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Does the stage's work.
    ///
    /// Resource-consuming calls should go through
    /// [`ExecutionContext::guarded_call`] so cancellation is observed.
    async fn process(
        &self,
        input: Self::Input,
        ctx: &ExecutionContext,
    ) -> Result<Self::Output, StageError>;

    /// Called before the payload is parsed.
    async fn on_start(&self, _ctx: &ExecutionContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Called after `process` succeeded and cancellation was re-checked.
    async fn on_complete(
        &self,
        _ctx: &ExecutionContext,
        _output: &Self::Output,
    ) -> Result<(), StageError> {
        Ok(())
    }

    /// Called when the invocation fails.
    async fn on_error(&self, _ctx: &ExecutionContext, _error: &StageError) {}

    /// Called when the invocation observes cancellation.
    async fn on_cancel(&self, _ctx: &ExecutionContext) {}
}

/// Object-safe view of a stage, as seen by the coordinator.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Serves one request. Never fails; errors become failed responses.
    async fn run(&self, request: Request, scope: StageScope) -> Response;

    /// Cancels the in-flight invocation, if any. Returns false when nothing
    /// was running or it was already cancelled.
    fn cancel(&self, reason: &str) -> bool;

    /// Returns the current status.
    fn status(&self) -> StageStatus;

    /// Returns the accumulated metrics.
    fn metrics(&self) -> StageMetrics;
}
