//! Sequences stage execution over a run.

use super::{CoordinatorConfig, CoordinatorResult, StageConfig, StageRegistry, StageResult};
use crate::context::{RunContext, StageScope};
use crate::errors::{ConfigError, ErrorCode, PhaseflowError};
use crate::events::{default_sink, MessageSink};
use crate::fsm::{PipelineEvent, PipelineState, PipelineStateMachine, TransitionRecord, TransitionRejection};
use crate::messages::{CancelMessage, ErrorMessage, ProgressUpdate, Request, Severity};
use crate::repository::RunStateRepository;
use crate::stages::StageRunner;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Source name used on coordinator-originated messages.
const COORDINATOR: &str = "coordinator";

/// How a stage ended after its attempt loop.
enum StageOutcome {
    Succeeded(StageResult, serde_json::Value),
    Exhausted(StageResult),
    Cancelled(String),
}

/// Drives a run through its stage groups.
///
/// Stages run strictly one after another, in declaration order within each
/// running state. Each group's completion event is fired once all of its
/// stages have checkpointed.
pub struct StageCoordinator {
    config: CoordinatorConfig,
    registry: Arc<StageRegistry>,
    fsm: PipelineStateMachine,
    repository: Option<Arc<dyn RunStateRepository>>,
    sink: Arc<dyn MessageSink>,
}

impl StageCoordinator {
    /// Creates a coordinator. The state machine guards are derived from the
    /// stage assignment in `config`.
    pub fn new(config: CoordinatorConfig, registry: Arc<StageRegistry>) -> Result<Self, ConfigError> {
        config.validate()?;
        let fsm = PipelineStateMachine::standard(&config.phase_requirements());
        Ok(Self {
            config,
            registry,
            fsm,
            repository: None,
            sink: default_sink(),
        })
    }

    /// Persists snapshots into `repository`.
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn RunStateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Sends progress, error and cancel notifications to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the state machine, e.g. to register observers.
    #[must_use]
    pub const fn state_machine(&self) -> &PipelineStateMachine {
        &self.fsm
    }

    /// Creates an idle run with the configured retry bound.
    #[must_use]
    pub fn create_run(&self, owner_id: impl Into<String>, input: serde_json::Value) -> RunContext {
        RunContext::new(owner_id, input).with_max_retries(self.config.max_retries)
    }

    /// Executes every configured stage against `ctx`.
    ///
    /// Never fails: rejections, missing stages, invalid inputs, exhausted
    /// retries and cancellation all end up in the returned result and in the
    /// run's error fields.
    #[instrument(skip_all, fields(run_id = %ctx.run_id()))]
    pub async fn execute(&self, ctx: &mut RunContext) -> CoordinatorResult {
        let started = Instant::now();
        info!(owner_id = ctx.owner_id(), "Run starting");

        if let Err(rejection) = self.fire(ctx, PipelineEvent::Start) {
            let message = format!("Cannot start run: {rejection}");
            warn!(state = %ctx.current_state(), reason = %rejection, "Run start rejected");
            // A finished run keeps the error fields of its own outcome.
            if !ctx.is_terminal() {
                ctx.record_error(message.clone(), Some(ErrorCode::PipelineInvalidState));
            }
            self.sink.on_error(
                &ErrorMessage::new(
                    ctx.run_id(),
                    ErrorCode::PipelineInvalidState,
                    message.clone(),
                    false,
                )
                .with_severity(Severity::Critical),
            );
            return CoordinatorResult {
                success: false,
                error: Some(message),
                error_code: Some(ErrorCode::PipelineInvalidState),
                ..Self::summarize(ctx, Vec::new(), started)
            };
        }

        self.run_groups(ctx, Vec::new(), false, started).await
    }

    /// Re-executes a persisted failed run.
    ///
    /// Fires `Retry` (subject to the run's retry bound) and runs the groups
    /// again, skipping stages whose checkpoints survived the failure.
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: Uuid) -> Result<(RunContext, CoordinatorResult), PhaseflowError> {
        let started = Instant::now();
        let repository = self
            .repository
            .as_ref()
            .ok_or(PhaseflowError::RunNotFound(run_id))?;
        let mut ctx = repository
            .load(run_id)
            .await?
            .ok_or(PhaseflowError::RunNotFound(run_id))?;

        self.fire(&mut ctx, PipelineEvent::Retry)?;
        info!(
            retry_count = ctx.retry_count(),
            checkpoints = ctx.checkpoints().len(),
            "Run resuming"
        );

        let result = self.run_groups(&mut ctx, Vec::new(), true, started).await;
        Ok((ctx, result))
    }

    async fn run_groups(
        &self,
        ctx: &mut RunContext,
        mut results: Vec<StageResult>,
        skip_checkpointed: bool,
        started: Instant,
    ) -> CoordinatorResult {
        for (state, stages) in self.config.groups() {
            for stage in stages {
                if skip_checkpointed && ctx.has_checkpoint(&stage.name) {
                    debug!(stage = %stage.name, "Stage already checkpointed, skipping");
                    continue;
                }

                if ctx.is_cancelled() {
                    return self.cancel_run(ctx, results, started).await;
                }
                ctx.set_current_stage(Some(stage.name.clone()));

                let Some(runner) = self.registry.get(&stage.name) else {
                    let message = format!("No stage registered under '{}'", stage.name);
                    return self
                        .fail_run(ctx, results, message, ErrorCode::AgentNotFound, started)
                        .await;
                };

                let payload = match resolve_inputs(ctx, stage) {
                    Ok(payload) => payload,
                    Err(missing) => {
                        let message = format!(
                            "Stage '{}' is missing required input '{missing}'",
                            stage.name
                        );
                        return self
                            .fail_run(ctx, results, message, ErrorCode::ValidationMissingField, started)
                            .await;
                    }
                };

                match self.run_stage(ctx, stage, runner.as_ref(), payload).await {
                    StageOutcome::Succeeded(result, output) => {
                        ctx.write_checkpoint(stage.name.clone(), output);
                        results.push(result);
                        self.save(ctx).await;
                    }
                    StageOutcome::Exhausted(result) => {
                        let message = format!(
                            "Stage '{}' failed after {} attempt(s): {}",
                            stage.name,
                            result.retry_attempts,
                            result.error.as_deref().unwrap_or("unknown error")
                        );
                        results.push(result);
                        return self
                            .fail_run(ctx, results, message, ErrorCode::StageProcessingFailed, started)
                            .await;
                    }
                    StageOutcome::Cancelled(reason) => {
                        debug!(stage = %stage.name, reason = %reason, "Stage observed cancellation");
                        return self.cancel_run(ctx, results, started).await;
                    }
                }
            }

            ctx.set_current_stage(None);
            let Some(event) = state.completion_event() else {
                continue;
            };
            if let Err(rejection) = self.fire(ctx, event) {
                let message = format!("Cannot complete {state}: {rejection}");
                return self
                    .fail_run(ctx, results, message, ErrorCode::PipelineInvalidTransition, started)
                    .await;
            }
        }

        info!(stages = results.len(), "Run complete");
        self.save(ctx).await;
        Self::summarize(ctx, results, started)
    }

    async fn run_stage(
        &self,
        ctx: &RunContext,
        stage: &StageConfig,
        runner: &dyn StageRunner,
        payload: serde_json::Value,
    ) -> StageOutcome {
        let started = Instant::now();
        let mut backoff = self.config.retry.backoff();
        let mut last_error = String::from("stage did not run");
        let mut last_code = ErrorCode::StageProcessingFailed;
        let mut attempts = 0;

        for attempt in 1..=stage.retry_count {
            if ctx.is_cancelled() {
                return StageOutcome::Cancelled(
                    ctx.cancellation()
                        .reason()
                        .unwrap_or_else(|| "cancellation requested".to_string()),
                );
            }
            attempts = attempt;

            let request = match Request::builder(ctx.run_id(), stage.name.clone())
                .source(COORDINATOR)
                .payload(payload.clone())
                .context(ctx.checkpoints().clone())
                .timeout(stage.timeout)
                .attempt(attempt, stage.retry_count)
                .build()
            {
                Ok(request) => request,
                Err(err) => {
                    last_error = err.to_string();
                    last_code = ErrorCode::ValidationInvalidFormat;
                    break;
                }
            };

            debug!(stage = %stage.name, attempt, max_attempts = stage.retry_count, "Running stage attempt");
            let scope = StageScope::new(ctx.cancellation(), self.sink.clone());

            match tokio::time::timeout(stage.timeout, runner.run(request, scope)).await {
                Ok(response) if response.is_success() => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    let output = response.into_payload().unwrap_or(serde_json::Value::Null);
                    info!(stage = %stage.name, attempt, elapsed_ms, "Stage succeeded");
                    return StageOutcome::Succeeded(
                        StageResult::success(stage.name.clone(), output.clone(), elapsed_ms, attempt),
                        output,
                    );
                }
                Ok(response) if response.is_cancelled() => {
                    return StageOutcome::Cancelled(
                        response.error().unwrap_or("cancelled").to_string(),
                    );
                }
                Ok(response) => {
                    last_error = response.error().unwrap_or("stage failed").to_string();
                    last_code = response
                        .error_code()
                        .unwrap_or(ErrorCode::StageProcessingFailed);
                }
                Err(_) => {
                    last_error = format!(
                        "Stage '{}' timed out after {:.3}s",
                        stage.name,
                        stage.timeout.as_secs_f64()
                    );
                    last_code = ErrorCode::StageTimeout;
                }
            }

            warn!(
                stage = %stage.name,
                attempt,
                max_attempts = stage.retry_count,
                code = %last_code,
                error = %last_error,
                "Stage attempt failed"
            );

            if attempt < stage.retry_count {
                self.sink.on_error(
                    &ErrorMessage::new(
                        ctx.run_id(),
                        last_code,
                        format!(
                            "Attempt {attempt}/{} failed, retrying: {last_error}",
                            stage.retry_count
                        ),
                        true,
                    )
                    .for_stage(&stage.name)
                    .with_severity(Severity::Warning)
                    .with_attempt(attempt),
                );
                let delay = backoff.delay_after(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        StageOutcome::Exhausted(StageResult::failure(
            stage.name.clone(),
            last_error,
            last_code,
            elapsed_ms,
            attempts,
        ))
    }

    /// Applies `event` and reports the new progress.
    fn fire(
        &self,
        ctx: &mut RunContext,
        event: PipelineEvent,
    ) -> Result<TransitionRecord, TransitionRejection> {
        let record = self.fsm.transition(ctx, event)?;
        info!(event = %event, from = %record.from, to = %record.to, "Run transitioned");
        self.sink.on_progress(&ProgressUpdate::new(
            ctx.run_id(),
            record.progress_pct,
            format!("{} -> {}", record.from, record.to),
        ));
        Ok(record)
    }

    async fn fail_run(
        &self,
        ctx: &mut RunContext,
        results: Vec<StageResult>,
        message: String,
        code: ErrorCode,
        started: Instant,
    ) -> CoordinatorResult {
        error!(stage = ?ctx.current_stage(), code = %code, error = %message, "Run failed");

        let mut notification = ErrorMessage::new(ctx.run_id(), code, message.clone(), false)
            .with_severity(Severity::Critical);
        if let Some(stage) = ctx.current_stage() {
            notification = notification.for_stage(stage);
        }

        ctx.record_error(message, Some(code));
        if let Err(rejection) = self.fire(ctx, PipelineEvent::Error) {
            warn!(reason = %rejection, "Could not move run to failed");
        }
        self.sink.on_error(&notification);
        self.save(ctx).await;
        Self::summarize(ctx, results, started)
    }

    async fn cancel_run(
        &self,
        ctx: &mut RunContext,
        results: Vec<StageResult>,
        started: Instant,
    ) -> CoordinatorResult {
        let reason = ctx
            .cancellation()
            .reason()
            .unwrap_or_else(|| "cancellation requested".to_string());
        info!(reason = %reason, completed_stages = results.len(), "Run cancelled");

        let mut notification = CancelMessage::new(ctx.run_id(), reason.clone());
        if let Some(stage) = ctx.current_stage() {
            notification = notification.for_stage(stage);
        }

        ctx.record_error(format!("Run cancelled: {reason}"), Some(ErrorCode::PipelineCancelled));
        if let Err(rejection) = self.fire(ctx, PipelineEvent::Cancel) {
            warn!(reason = %rejection, "Could not move run to cancelled");
        }
        self.sink.on_cancel(&notification);
        self.save(ctx).await;
        Self::summarize(ctx, results, started)
    }

    async fn save(&self, ctx: &RunContext) {
        if !self.config.save_snapshots {
            return;
        }
        let Some(repository) = &self.repository else {
            return;
        };
        if let Err(err) = repository.save(ctx).await {
            error!(state = %ctx.current_state(), error = %err, "Failed to save run snapshot");
            self.sink.on_error(
                &ErrorMessage::new(
                    ctx.run_id(),
                    ErrorCode::StageCheckpointFailed,
                    err.to_string(),
                    true,
                )
                .with_severity(Severity::Warning),
            );
        }
    }

    fn summarize(ctx: &RunContext, stage_results: Vec<StageResult>, started: Instant) -> CoordinatorResult {
        CoordinatorResult {
            run_id: ctx.run_id(),
            success: ctx.current_state() == PipelineState::Complete,
            stage_results,
            output: ctx.merged_output(),
            error: ctx.error_message().map(str::to_string),
            error_code: ctx.error_code(),
            final_state: ctx.current_state(),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

impl std::fmt::Debug for StageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCoordinator")
            .field("stages", &self.config.stages.len())
            .field("registry", &self.registry)
            .field("persistent", &self.repository.is_some())
            .finish_non_exhaustive()
    }
}

/// Builds the request payload from the stage's declared inputs.
///
/// A stage that declares no inputs receives the whole run input. Returns the
/// first required input that resolves to nothing.
fn resolve_inputs(ctx: &RunContext, stage: &StageConfig) -> Result<serde_json::Value, String> {
    if stage.required_inputs.is_empty() && stage.optional_inputs.is_empty() {
        return Ok(ctx.input().clone());
    }

    let mut payload = serde_json::Map::new();
    for key in &stage.required_inputs {
        let value = ctx.resolve(key).ok_or_else(|| key.clone())?;
        payload.insert(key.clone(), value);
    }
    for key in &stage.optional_inputs {
        if let Some(value) = ctx.resolve(key) {
            payload.insert(key.clone(), value);
        }
    }
    Ok(serde_json::Value::Object(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RetryConfig;
    use crate::events::CollectingMessageSink;
    use crate::repository::{MockRunStateRepository, RepositoryError};
    use crate::stages::{FnStage, StageError};
    use serde_json::json;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::new(vec![
            StageConfig::new("parse", PipelineState::RunningA).requires("hierarchy"),
            StageConfig::new("generate", PipelineState::RunningB).requires("parse"),
            StageConfig::new("render", PipelineState::RunningC)
                .requires("generate")
                .accepts("options"),
        ])
        .with_retry(RetryConfig::immediate())
    }

    fn registry() -> Arc<StageRegistry> {
        Arc::new(
            StageRegistry::new()
                .with_stage(FnStage::new("parse", |input, _| {
                    Ok(json!({"sections": input["hierarchy"]["sections"]}))
                }))
                .with_stage(FnStage::new("generate", |input, _| {
                    Ok(json!({"paths": input["parse"]["sections"]}))
                }))
                .with_stage(FnStage::new("render", |input, _| {
                    Ok(json!({"dpi": input.get("options").map_or(json!(72), |o| o["dpi"].clone())}))
                })),
        )
    }

    #[test]
    fn test_resolve_inputs() {
        let mut ctx = RunContext::new("o", json!({"hierarchy": {"a": 1}, "options": {"dpi": 300}}));
        ctx.write_checkpoint("parse", json!({"n": 2}));

        let stage = StageConfig::new("generate", PipelineState::RunningB)
            .requires("parse")
            .accepts("options")
            .accepts("missing");
        assert_eq!(
            resolve_inputs(&ctx, &stage).unwrap(),
            json!({"parse": {"n": 2}, "options": {"dpi": 300}})
        );

        let stage = StageConfig::new("render", PipelineState::RunningC).requires("generate");
        assert_eq!(resolve_inputs(&ctx, &stage).unwrap_err(), "generate");

        let bare = StageConfig::new("bare", PipelineState::RunningA);
        assert_eq!(resolve_inputs(&ctx, &bare).unwrap(), *ctx.input());
    }

    #[tokio::test]
    async fn test_execute_passes_resolved_inputs() {
        let coordinator = StageCoordinator::new(config(), registry())
            .unwrap()
            .with_sink(Arc::new(CollectingMessageSink::new()));
        let mut ctx = coordinator.create_run(
            "owner",
            json!({"hierarchy": {"sections": 3}, "options": {"dpi": 300}}),
        );

        let result = coordinator.execute(&mut ctx).await;

        assert!(result.success);
        assert_eq!(
            result.output,
            json!({
                "parse": {"sections": 3},
                "generate": {"paths": 3},
                "render": {"dpi": 300}
            })
        );
    }

    #[tokio::test]
    async fn test_missing_stage_implementation() {
        let registry = Arc::new(StageRegistry::new().with_stage(FnStage::new("parse", |_, _| {
            Ok(json!({"sections": 1}))
        })));
        let coordinator = StageCoordinator::new(config(), registry)
            .unwrap()
            .with_sink(Arc::new(CollectingMessageSink::new()));
        let mut ctx = coordinator.create_run("owner", json!({"hierarchy": {"sections": 1}}));

        let result = coordinator.execute(&mut ctx).await;

        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::AgentNotFound));
        assert_eq!(result.final_state, PipelineState::Failed);
        assert_eq!(result.stage_results.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_on_finished_run_is_rejected() {
        let sink = Arc::new(CollectingMessageSink::new());
        let coordinator = StageCoordinator::new(config(), registry())
            .unwrap()
            .with_sink(sink.clone());
        let mut ctx = coordinator.create_run("owner", json!({"hierarchy": {"sections": 1}}));
        assert!(coordinator.execute(&mut ctx).await.success);
        let finished = ctx.clone();

        let again = coordinator.execute(&mut ctx).await;

        assert!(!again.success);
        assert_eq!(again.final_state, PipelineState::Complete);
        assert_eq!(again.error_code, Some(ErrorCode::PipelineInvalidState));
        assert!(again.error.is_some_and(|e| e.starts_with("Cannot start run")));
        assert!(again.stage_results.is_empty());
        assert_eq!(ctx, finished);
        assert!(ctx.error_message().is_none());
        assert_eq!(
            sink.errors().last().map(|e| e.code),
            Some(ErrorCode::PipelineInvalidState)
        );
    }

    #[tokio::test]
    async fn test_missing_required_input_is_fatal() {
        let config = CoordinatorConfig::new(vec![StageConfig::new("parse", PipelineState::RunningA)
            .requires("outline")])
        .with_retry(RetryConfig::immediate());
        let coordinator = StageCoordinator::new(config, registry())
            .unwrap()
            .with_sink(Arc::new(CollectingMessageSink::new()));
        let mut ctx = coordinator.create_run("owner", json!({"hierarchy": {"sections": 1}}));

        let result = coordinator.execute(&mut ctx).await;

        assert_eq!(result.error_code, Some(ErrorCode::ValidationMissingField));
        assert!(result.stage_results.is_empty());
        assert!(ctx.error_message().is_some_and(|m| m.contains("outline")));
    }

    #[tokio::test]
    async fn test_snapshot_failure_does_not_abort_run() {
        let mut repository = MockRunStateRepository::new();
        repository
            .expect_save()
            .returning(|_| Err(RepositoryError::Backend("disk full".into())));

        let sink = Arc::new(CollectingMessageSink::new());
        let coordinator = StageCoordinator::new(config(), registry())
            .unwrap()
            .with_repository(Arc::new(repository))
            .with_sink(sink.clone());
        let mut ctx = coordinator.create_run("owner", json!({"hierarchy": {"sections": 2}}));

        let result = coordinator.execute(&mut ctx).await;

        assert!(result.success);
        let checkpoint_failures = sink
            .errors()
            .into_iter()
            .filter(|e| e.code == ErrorCode::StageCheckpointFailed)
            .count();
        // three checkpoints plus the terminal transition
        assert_eq!(checkpoint_failures, 4);
    }

    #[tokio::test]
    async fn test_snapshots_can_be_disabled() {
        let mut repository = MockRunStateRepository::new();
        repository.expect_save().never();

        let coordinator = StageCoordinator::new(config().with_save_snapshots(false), registry())
            .unwrap()
            .with_repository(Arc::new(repository))
            .with_sink(Arc::new(CollectingMessageSink::new()));
        let mut ctx = coordinator.create_run("owner", json!({"hierarchy": {"sections": 2}}));

        assert!(coordinator.execute(&mut ctx).await.success);
    }

    #[tokio::test]
    async fn test_resume_requires_a_stored_run() {
        let coordinator = StageCoordinator::new(config(), registry()).unwrap();
        let run_id = Uuid::new_v4();

        let err = coordinator.resume(run_id).await.unwrap_err();
        assert!(matches!(err, PhaseflowError::RunNotFound(id) if id == run_id));
    }

    #[tokio::test]
    async fn test_stage_error_codes_propagate_to_stage_result() {
        let registry = Arc::new(StageRegistry::new().with_stage(FnStage::new("parse", |_, _| {
            Err(StageError::unavailable("renderer offline"))
        })));
        let config = CoordinatorConfig::new(vec![
            StageConfig::new("parse", PipelineState::RunningA).with_retry_count(2)
        ])
        .with_retry(RetryConfig::immediate());
        let sink = Arc::new(CollectingMessageSink::new());
        let coordinator = StageCoordinator::new(config, registry)
            .unwrap()
            .with_sink(sink.clone());
        let mut ctx = coordinator.create_run("owner", json!({"hierarchy": [1]}));

        let result = coordinator.execute(&mut ctx).await;

        let stage = result.stage("parse").unwrap();
        assert_eq!(stage.retry_attempts, 2);
        assert_eq!(stage.error_code, Some(ErrorCode::ResourceUnavailable));
        assert_eq!(result.error_code, Some(ErrorCode::StageProcessingFailed));

        let retry_notices: Vec<_> = sink
            .errors()
            .into_iter()
            .filter(|e| e.severity == Severity::Warning)
            .collect();
        assert_eq!(retry_notices.len(), 1);
        assert!(retry_notices[0].recoverable);
        assert_eq!(retry_notices[0].attempt, Some(1));
    }
}
