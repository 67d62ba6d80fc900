//! Per-invocation scratch space handed to a stage.

use crate::cancellation::CancellationToken;
use crate::events::{default_sink, MessageSink};
use crate::messages::{ErrorMessage, ProgressUpdate, Request, ResourceUsage, Severity};
use crate::stages::StageError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// The run-level collaborators a stage invocation is bound to.
#[derive(Clone)]
pub struct StageScope {
    /// The run's cancellation flag.
    pub cancellation: Arc<CancellationToken>,
    /// Where progress and error notifications go.
    pub sink: Arc<dyn MessageSink>,
}

impl StageScope {
    /// Creates a scope.
    #[must_use]
    pub fn new(cancellation: Arc<CancellationToken>, sink: Arc<dyn MessageSink>) -> Self {
        Self { cancellation, sink }
    }

    /// A scope with its own cancellation flag and the default logging sink.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(CancellationToken::shared(), default_sink())
    }
}

impl std::fmt::Debug for StageScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageScope")
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

/// Mutable context for one stage invocation.
///
/// Observes two cancellation flags: the run's, and the stage instance's own
/// (set through [`crate::stages::StageRunner::cancel`]).
pub struct ExecutionContext {
    run_id: Uuid,
    stage_name: String,
    request_id: Uuid,
    attempt: u32,
    inherited: HashMap<String, serde_json::Value>,
    started: Instant,
    run_cancellation: Arc<CancellationToken>,
    stage_cancellation: Arc<CancellationToken>,
    sink: Arc<dyn MessageSink>,
    usage: Mutex<ResourceUsage>,
}

impl ExecutionContext {
    /// Binds a new context to `request`.
    #[must_use]
    pub fn new(
        request: &Request,
        stage_name: impl Into<String>,
        scope: StageScope,
        stage_cancellation: Arc<CancellationToken>,
    ) -> Self {
        Self {
            run_id: request.run_id(),
            stage_name: stage_name.into(),
            request_id: request.message_id(),
            attempt: request.attempt(),
            inherited: request.context().clone(),
            started: Instant::now(),
            run_cancellation: scope.cancellation,
            stage_cancellation,
            sink: scope.sink,
            usage: Mutex::new(ResourceUsage::default()),
        }
    }

    /// Returns the run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Returns the id of the request being served.
    #[must_use]
    pub const fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns a checkpoint inherited from an earlier stage.
    #[must_use]
    pub fn checkpoint(&self, stage: &str) -> Option<&serde_json::Value> {
        self.inherited.get(stage)
    }

    /// Returns all inherited checkpoints.
    #[must_use]
    pub const fn checkpoints(&self) -> &HashMap<String, serde_json::Value> {
        &self.inherited
    }

    /// Returns the time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns true if the run or this stage instance was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.run_cancellation.is_cancelled() || self.stage_cancellation.is_cancelled()
    }

    /// Returns the first available cancellation reason.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.run_cancellation
            .reason()
            .or_else(|| self.stage_cancellation.reason())
    }

    /// Fails with [`StageError::Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), StageError> {
        if self.is_cancelled() {
            return Err(StageError::Cancelled(
                self.cancel_reason()
                    .unwrap_or_else(|| "cancellation requested".to_string()),
            ));
        }
        Ok(())
    }

    /// Emits a stage-scoped progress update.
    pub fn emit_progress(&self, percent: u8, message: impl Into<String>) {
        let update = ProgressUpdate::new(self.run_id, percent, message).for_stage(&self.stage_name);
        self.sink.on_progress(&update);
    }

    /// Emits an error notification classified from `error`.
    pub fn emit_error(&self, error: &StageError) {
        let message = ErrorMessage::new(
            self.run_id,
            error.code(),
            error.to_string(),
            error.is_recoverable(),
        )
        .for_stage(&self.stage_name)
        .with_severity(Severity::Error)
        .with_attempt(self.attempt);
        self.sink.on_error(&message);
    }

    /// Adds usage accounting for a resource call.
    pub fn record_usage(&self, usage: &ResourceUsage) {
        self.usage.lock().merge(usage);
    }

    /// Returns the usage accumulated so far.
    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        *self.usage.lock()
    }

    /// Issues a resource-consuming call, honoring cancellation first.
    ///
    /// The call returns its value with usage accounting; when the call does
    /// not report latency, the measured wall time is recorded instead.
    pub async fn guarded_call<T, F, Fut>(&self, call: F) -> Result<T, StageError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(T, ResourceUsage), StageError>> + Send,
    {
        self.check_cancelled()?;

        let started = Instant::now();
        let (value, mut usage) = call().await?;
        if usage.latency_ms <= 0.0 {
            usage.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        }
        if usage.calls == 0 {
            usage.calls = 1;
        }

        debug!(
            run_id = %self.run_id,
            stage = %self.stage_name,
            tokens = usage.tokens,
            latency_ms = usage.latency_ms,
            "Resource call completed"
        );
        self.record_usage(&usage);
        Ok(value)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("stage_name", &self.stage_name)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingMessageSink;
    use serde_json::json;

    fn request() -> Request {
        Request::builder(Uuid::new_v4(), "generate")
            .context(HashMap::from([("parse".to_string(), json!({"nodes": 2}))]))
            .attempt(2, 3)
            .build()
            .unwrap()
    }

    fn context(sink: Arc<CollectingMessageSink>) -> (ExecutionContext, Arc<CancellationToken>) {
        let run_token = CancellationToken::shared();
        let scope = StageScope::new(run_token.clone(), sink);
        let ctx = ExecutionContext::new(&request(), "generate", scope, CancellationToken::shared());
        (ctx, run_token)
    }

    #[test]
    fn test_context_is_bound_to_request() {
        let (ctx, _) = context(Arc::new(CollectingMessageSink::new()));
        assert_eq!(ctx.stage_name(), "generate");
        assert_eq!(ctx.attempt(), 2);
        assert_eq!(ctx.checkpoint("parse"), Some(&json!({"nodes": 2})));
        assert!(!ctx.is_cancelled());
        assert!(ctx.check_cancelled().is_ok());
    }

    #[test]
    fn test_run_cancellation_is_observed() {
        let (ctx, run_token) = context(Arc::new(CollectingMessageSink::new()));
        run_token.cancel("user abort");

        assert!(ctx.is_cancelled());
        let err = ctx.check_cancelled().unwrap_err();
        assert!(matches!(err, StageError::Cancelled(reason) if reason == "user abort"));
    }

    #[test]
    fn test_emitters_reach_the_sink() {
        let sink = Arc::new(CollectingMessageSink::new());
        let (ctx, _) = context(sink.clone());

        ctx.emit_progress(50, "halfway");
        ctx.emit_error(&StageError::timeout("slow upstream"));

        let progress = sink.progress();
        assert_eq!(progress[0].percent, 50);
        assert_eq!(progress[0].stage.as_deref(), Some("generate"));

        let errors = sink.errors();
        assert!(errors[0].recoverable);
        assert_eq!(errors[0].attempt, Some(2));
    }

    #[tokio::test]
    async fn test_guarded_call_records_usage() {
        let (ctx, _) = context(Arc::new(CollectingMessageSink::new()));

        let value = ctx
            .guarded_call(|| async { Ok((json!("ok"), ResourceUsage::single(120, 8.0))) })
            .await
            .unwrap();

        assert_eq!(value, json!("ok"));
        let usage = ctx.usage();
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.tokens, 120);
    }

    #[tokio::test]
    async fn test_guarded_call_refuses_after_cancellation() {
        let (ctx, run_token) = context(Arc::new(CollectingMessageSink::new()));
        run_token.cancel("stop");

        let mut invoked = false;
        let result: Result<(), StageError> = ctx
            .guarded_call(|| {
                invoked = true;
                async { Ok(((), ResourceUsage::default())) }
            })
            .await;

        assert!(matches!(result, Err(StageError::Cancelled(_))));
        assert!(!invoked);
        assert!(ctx.usage().is_empty());
    }
}
