//! Drives a typed [`Stage`] through its lifecycle.

use super::{Stage, StageError, StageMetrics, StageRunner, StageStatus};
use crate::cancellation::CancellationToken;
use crate::context::{ExecutionContext, StageScope};
use crate::messages::{CancelMessage, Request, ResourceUsage, Response};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Wraps a [`Stage`] as an object-safe [`StageRunner`].
///
/// `run` never fails: every error raised between `on_start` and
/// `on_complete` is classified into a failed [`Response`].
pub struct StageExecutor<S: Stage> {
    stage: S,
    status: Mutex<StageStatus>,
    metrics: Mutex<StageMetrics>,
    attached: Mutex<Option<Arc<CancellationToken>>>,
}

impl<S: Stage> StageExecutor<S> {
    /// Wraps `stage`.
    pub fn new(stage: S) -> Self {
        Self {
            stage,
            status: Mutex::new(StageStatus::Idle),
            metrics: Mutex::new(StageMetrics::default()),
            attached: Mutex::new(None),
        }
    }

    /// Wraps `stage` behind a shared trait object.
    pub fn shared(stage: S) -> Arc<dyn StageRunner>
    where
        S: 'static,
    {
        Arc::new(Self::new(stage))
    }

    /// Returns the wrapped stage.
    pub const fn stage(&self) -> &S {
        &self.stage
    }

    async fn lifecycle(
        &self,
        request: &Request,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, StageError> {
        self.stage.on_start(ctx).await?;
        ctx.check_cancelled()?;

        let input: S::Input = serde_json::from_value(request.payload().clone())
            .map_err(|e| StageError::InvalidInput(e.to_string()))?;

        ctx.emit_progress(0, format!("{} started", self.stage.name()));

        let output = AssertUnwindSafe(self.stage.process(input, ctx))
            .catch_unwind()
            .await
            .map_err(|panic| StageError::Panicked(panic_message(panic.as_ref())))??;

        ctx.check_cancelled()?;
        self.stage.on_complete(ctx, &output).await?;

        let payload = serde_json::to_value(&output)
            .map_err(|e| StageError::processing(format!("output is not serializable: {e}")))?;
        ctx.emit_progress(100, format!("{} completed", self.stage.name()));
        Ok(payload)
    }

    async fn respond(
        &self,
        request: &Request,
        ctx: &ExecutionContext,
        scope: &StageScope,
        outcome: Result<serde_json::Value, StageError>,
    ) -> (StageStatus, Response) {
        let elapsed_ms = ctx.elapsed().as_secs_f64() * 1000.0;
        let usage = ctx.usage();

        match outcome {
            Ok(payload) => {
                debug!(stage = self.stage.name(), elapsed_ms, "Stage completed");
                (
                    StageStatus::Completed,
                    Response::success(request, payload, elapsed_ms).with_usage(usage),
                )
            }
            Err(StageError::Cancelled(reason)) => {
                self.stage.on_cancel(ctx).await;
                info!(stage = self.stage.name(), reason = %reason, "Stage cancelled");
                scope.sink.on_cancel(
                    &CancelMessage::new(request.run_id(), reason.clone()).for_stage(self.stage.name()),
                );
                (
                    StageStatus::Cancelled,
                    Response::cancelled(request, reason, elapsed_ms).with_usage(usage),
                )
            }
            Err(err) => {
                self.stage.on_error(ctx, &err).await;
                warn!(
                    stage = self.stage.name(),
                    attempt = request.attempt(),
                    error = %err,
                    recoverable = err.is_recoverable(),
                    "Stage failed"
                );
                ctx.emit_error(&err);
                (
                    StageStatus::Failed,
                    Response::failure(
                        request,
                        err.to_string(),
                        err.code(),
                        err.is_recoverable(),
                        elapsed_ms,
                    )
                    .with_usage(usage),
                )
            }
        }
    }
}

#[async_trait]
impl<S: Stage> StageRunner for StageExecutor<S> {
    fn name(&self) -> &str {
        self.stage.name()
    }

    async fn run(&self, request: Request, scope: StageScope) -> Response {
        let stage_token = CancellationToken::shared();
        let mut attachment = Attachment::new(self, stage_token.clone());

        let ctx = ExecutionContext::new(&request, self.stage.name(), scope.clone(), stage_token);
        let outcome = self.lifecycle(&request, &ctx).await;
        let (status, response) = self.respond(&request, &ctx, &scope, outcome).await;

        attachment.finish(status, response.elapsed_ms(), &ctx.usage());
        response
    }

    fn cancel(&self, reason: &str) -> bool {
        match self.attached.lock().as_ref() {
            Some(token) => token.cancel(reason),
            None => false,
        }
    }

    fn status(&self) -> StageStatus {
        *self.status.lock()
    }

    fn metrics(&self) -> StageMetrics {
        *self.metrics.lock()
    }
}

impl<S: Stage> std::fmt::Debug for StageExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("stage", &self.stage.name())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Binds an invocation's cancellation token to the executor while it runs.
///
/// Dropping it detaches the token, so `cancel` after `run` returns is a
/// no-op. If the invocation future is dropped mid-flight (a coordinator
/// timeout), the invocation is recorded as failed.
struct Attachment<'a> {
    status: &'a Mutex<StageStatus>,
    metrics: &'a Mutex<StageMetrics>,
    attached: &'a Mutex<Option<Arc<CancellationToken>>>,
    started: std::time::Instant,
    finished: bool,
}

impl<'a> Attachment<'a> {
    fn new<S: Stage>(executor: &'a StageExecutor<S>, token: Arc<CancellationToken>) -> Self {
        *executor.status.lock() = StageStatus::Processing;
        *executor.attached.lock() = Some(token);
        Self {
            status: &executor.status,
            metrics: &executor.metrics,
            attached: &executor.attached,
            started: std::time::Instant::now(),
            finished: false,
        }
    }

    fn finish(&mut self, status: StageStatus, elapsed_ms: f64, usage: &ResourceUsage) {
        *self.status.lock() = status;
        self.metrics.lock().record(status, elapsed_ms, usage);
        self.finished = true;
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        self.attached.lock().take();
        if !self.finished {
            let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
            *self.status.lock() = StageStatus::Failed;
            self.metrics
                .lock()
                .record(StageStatus::Failed, elapsed_ms, &ResourceUsage::default());
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
