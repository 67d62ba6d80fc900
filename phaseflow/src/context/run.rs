//! The per-run context owned by the coordinating task.

use crate::cancellation::{CancelHandle, CancellationToken};
use crate::errors::ErrorCode;
use crate::fsm::{PipelineEvent, PipelineState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Default bound on whole-run retries.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One entry of a run's append-only event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// The event that was applied.
    pub event: PipelineEvent,
    /// The state the run entered.
    pub state: PipelineState,
    /// When the transition was committed.
    pub timestamp: DateTime<Utc>,
}

/// Everything known about one run.
///
/// Lifecycle fields (state, progress, timestamps, event log, retry count)
/// are only mutated by the state machine; checkpoints and error details by
/// the coordinator. The cancellation flag is runtime-only and is not
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    run_id: Uuid,
    owner_id: String,
    current_state: PipelineState,
    #[serde(default)]
    previous_state: Option<PipelineState>,
    #[serde(default)]
    input: serde_json::Value,
    #[serde(default)]
    checkpoints: HashMap<String, serde_json::Value>,
    #[serde(default)]
    progress_pct: u8,
    #[serde(default)]
    current_stage: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_code: Option<ErrorCode>,
    #[serde(default)]
    retry_count: u32,
    max_retries: u32,
    created_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    event_log: Vec<EventLogEntry>,
    #[serde(skip)]
    cancellation: CancelHandle,
}

impl RunContext {
    /// Creates an idle run for `owner_id` with the given input payload.
    #[must_use]
    pub fn new(owner_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            current_state: PipelineState::Idle,
            previous_state: None,
            input,
            checkpoints: HashMap::new(),
            progress_pct: 0,
            current_stage: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            event_log: Vec::new(),
            cancellation: CancelHandle::new(),
        }
    }

    /// Sets a specific run id.
    #[must_use]
    pub const fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Sets the whole-run retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns the run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the owner id.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Returns the current state.
    #[must_use]
    pub const fn current_state(&self) -> PipelineState {
        self.current_state
    }

    /// Returns the state before the last transition.
    #[must_use]
    pub const fn previous_state(&self) -> Option<PipelineState> {
        self.previous_state
    }

    /// Returns the input payload.
    #[must_use]
    pub const fn input(&self) -> &serde_json::Value {
        &self.input
    }

    /// Returns a top-level run field: an input key, `run_id` or `owner_id`.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "run_id" => Some(serde_json::json!(self.run_id.to_string())),
            "owner_id" => Some(serde_json::json!(self.owner_id)),
            _ => self.input.get(key).cloned(),
        }
    }

    /// Resolves a stage input from top-level fields, then checkpoints.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<serde_json::Value> {
        self.field(key).or_else(|| self.checkpoints.get(key).cloned())
    }

    /// Returns all checkpoints.
    #[must_use]
    pub const fn checkpoints(&self) -> &HashMap<String, serde_json::Value> {
        &self.checkpoints
    }

    /// Returns one checkpoint.
    #[must_use]
    pub fn checkpoint(&self, stage: &str) -> Option<&serde_json::Value> {
        self.checkpoints.get(stage)
    }

    /// Returns true if `stage` has checkpointed output.
    #[must_use]
    pub fn has_checkpoint(&self, stage: &str) -> bool {
        self.checkpoints.contains_key(stage)
    }

    /// Stores a stage's output, replacing any earlier value.
    pub fn write_checkpoint(&mut self, stage: impl Into<String>, output: serde_json::Value) {
        self.checkpoints.insert(stage.into(), output);
    }

    /// Merges all checkpoints into one object keyed by stage name.
    #[must_use]
    pub fn merged_output(&self) -> serde_json::Value {
        let merged: serde_json::Map<String, serde_json::Value> = self
            .checkpoints
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::Value::Object(merged)
    }

    /// Returns overall progress, 0..=100.
    #[must_use]
    pub const fn progress_pct(&self) -> u8 {
        self.progress_pct
    }

    /// Returns the stage currently executing.
    #[must_use]
    pub fn current_stage(&self) -> Option<&str> {
        self.current_stage.as_deref()
    }

    /// Sets or clears the stage currently executing.
    pub fn set_current_stage(&mut self, stage: Option<String>) {
        self.current_stage = stage;
    }

    /// Returns the recorded error text.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns the recorded error code.
    #[must_use]
    pub const fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    /// Records why the run failed.
    pub fn record_error(&mut self, message: impl Into<String>, code: Option<ErrorCode>) {
        self.error_message = Some(message.into());
        self.error_code = code;
    }

    /// Returns how many whole-run retries have been used.
    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns the whole-run retry bound.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns true while another whole-run retry is allowed.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the run first entered a running state.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Returns when the run entered its terminal state.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Returns the event log, oldest first.
    #[must_use]
    pub fn event_log(&self) -> &[EventLogEntry] {
        &self.event_log
    }

    /// Returns true if the run is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// Requests cooperative cancellation of the run.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.cancellation.cancel(reason)
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns a token that can cancel this run from another task.
    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        self.cancellation.token()
    }

    /// Returns a cloneable handle sharing this run's cancellation flag.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancellation.clone()
    }

    pub(crate) fn commit_transition(
        &mut self,
        event: PipelineEvent,
        to: PipelineState,
        progress_pct: u8,
    ) -> DateTime<Utc> {
        let now = Utc::now();
        let from = self.current_state;

        self.event_log.push(EventLogEntry {
            event,
            state: to,
            timestamp: now,
        });
        self.previous_state = Some(from);
        self.current_state = to;
        self.progress_pct = progress_pct;

        if to == PipelineState::RunningA && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        } else if from.is_terminal() {
            self.completed_at = None;
        }
        now
    }

    pub(crate) fn increment_retry(&mut self) {
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
    }

    pub(crate) fn clear_error(&mut self) {
        self.error_message = None;
        self.error_code = None;
    }

    pub(crate) fn reset_for_rerun(&mut self) {
        self.checkpoints.clear();
        self.current_stage = None;
        self.error_message = None;
        self.error_code = None;
        self.retry_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.cancellation.clear();
    }

    #[cfg(test)]
    pub(crate) fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx() -> RunContext {
        RunContext::new("owner-1", json!({"hierarchy": {"title": "doc"}, "options": {"dpi": 300}}))
    }

    #[test]
    fn test_new_context_defaults() {
        let ctx = ctx();
        assert_eq!(ctx.current_state(), PipelineState::Idle);
        assert!(ctx.previous_state().is_none());
        assert_eq!(ctx.progress_pct(), 0);
        assert_eq!(ctx.retry_count(), 0);
        assert_eq!(ctx.max_retries(), DEFAULT_MAX_RETRIES);
        assert!(ctx.event_log().is_empty());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_checkpoint_last_write_wins() {
        let mut ctx = ctx();
        ctx.write_checkpoint("X", json!("A"));
        ctx.write_checkpoint("X", json!("B"));

        assert_eq!(ctx.checkpoint("X"), Some(&json!("B")));
        assert_eq!(ctx.checkpoints().len(), 1);
    }

    #[test]
    fn test_resolve_prefers_fields_then_checkpoints() {
        let mut ctx = ctx();
        ctx.write_checkpoint("parse", json!({"nodes": 4}));

        assert_eq!(ctx.resolve("hierarchy"), Some(json!({"title": "doc"})));
        assert_eq!(ctx.resolve("parse"), Some(json!({"nodes": 4})));
        assert_eq!(ctx.resolve("owner_id"), Some(json!("owner-1")));
        assert!(ctx.resolve("render").is_none());
    }

    #[test]
    fn test_merged_output() {
        let mut ctx = ctx();
        ctx.write_checkpoint("a", json!(1));
        ctx.write_checkpoint("b", json!({"k": true}));
        assert_eq!(ctx.merged_output(), json!({"a": 1, "b": {"k": true}}));
    }

    #[test]
    fn test_increment_retry_is_bounded() {
        let mut ctx = ctx().with_max_retries(1);
        ctx.increment_retry();
        ctx.increment_retry();
        assert_eq!(ctx.retry_count(), 1);
        assert!(!ctx.can_retry());
    }

    #[test]
    fn test_cancellation_handle_is_shared() {
        let ctx = ctx();
        let token = ctx.cancellation();
        token.cancel("stop");
        assert!(ctx.is_cancelled());

        let handle = ctx.cancel_handle();
        assert!(handle.is_cancelled());
        assert_eq!(handle.reason().as_deref(), Some("stop"));
    }

    #[test]
    fn test_serde_round_trip_preserves_every_field() {
        let mut ctx = ctx().with_max_retries(5);
        ctx.commit_transition(PipelineEvent::Start, PipelineState::RunningA, 10);
        ctx.write_checkpoint("parse", json!({"sections": [1, 2]}));
        ctx.set_current_stage(Some("layout".to_string()));
        ctx.set_retry_count(2);
        ctx.record_error("flaky", Some(ErrorCode::StageTimeout));

        let json = serde_json::to_string(&ctx).unwrap();
        let back: RunContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }
}
