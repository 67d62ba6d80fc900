//! Applies events to a run through the transition table.

use super::{progress_for, PhaseRequirements, PipelineEvent, PipelineState, TransitionTable};
use crate::context::RunContext;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Why an event was not applied. The run is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionRejection {
    /// No entry for `(from, event)`.
    #[error("no transition")]
    NoTransition {
        /// State the run was in.
        from: PipelineState,
        /// Rejected event.
        event: PipelineEvent,
    },
    /// A guard returned false.
    #[error("{guard} failed")]
    GuardFailed {
        /// State the run was in.
        from: PipelineState,
        /// Rejected event.
        event: PipelineEvent,
        /// Name of the first failing guard.
        guard: String,
    },
}

impl TransitionRejection {
    /// Returns the rejected event.
    #[must_use]
    pub const fn event(&self) -> PipelineEvent {
        match self {
            Self::NoTransition { event, .. } | Self::GuardFailed { event, .. } => *event,
        }
    }

    /// Returns the state the run stayed in.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        match self {
            Self::NoTransition { from, .. } | Self::GuardFailed { from, .. } => *from,
        }
    }
}

/// A committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// State before.
    pub from: PipelineState,
    /// Applied event.
    pub event: PipelineEvent,
    /// State after.
    pub to: PipelineState,
    /// Progress after.
    pub progress_pct: u8,
    /// Commit time, as written to the event log.
    pub timestamp: DateTime<Utc>,
}

/// Notified after each committed transition.
pub trait TransitionObserver: Send + Sync {
    /// Called once the transition and its actions have run.
    fn on_transition(&self, record: &TransitionRecord, ctx: &RunContext);
}

impl<F> TransitionObserver for F
where
    F: Fn(&TransitionRecord, &RunContext) + Send + Sync,
{
    fn on_transition(&self, record: &TransitionRecord, ctx: &RunContext) {
        self(record, ctx);
    }
}

/// The run lifecycle state machine.
///
/// Holds no per-run state; one machine can drive any number of runs.
pub struct PipelineStateMachine {
    table: TransitionTable,
    observers: RwLock<Vec<Arc<dyn TransitionObserver>>>,
}

impl PipelineStateMachine {
    /// Creates a machine over `table`.
    #[must_use]
    pub fn new(table: TransitionTable) -> Self {
        Self {
            table,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Creates a machine over the standard table.
    #[must_use]
    pub fn standard(requirements: &PhaseRequirements) -> Self {
        Self::new(TransitionTable::standard(requirements))
    }

    /// Returns the table.
    #[must_use]
    pub const fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Registers an observer.
    pub fn add_observer(&self, observer: Arc<dyn TransitionObserver>) {
        self.observers.write().push(observer);
    }

    /// Applies `event` to `ctx`.
    ///
    /// On rejection the context is not modified. On success the event log,
    /// states, progress and timestamps are updated, then the transition's
    /// actions and the observers run; their failures are logged and never
    /// undo the commit.
    pub fn transition(
        &self,
        ctx: &mut RunContext,
        event: PipelineEvent,
    ) -> Result<TransitionRecord, TransitionRejection> {
        let from = ctx.current_state();
        let transition = self.check(ctx, event)?;

        let to = transition.to;
        let progress_pct = progress_for(to);
        let timestamp = ctx.commit_transition(event, to, progress_pct);

        debug!(
            run_id = %ctx.run_id(),
            event = %event,
            from = %from,
            to = %to,
            progress = progress_pct,
            "Transition applied"
        );

        for action in &transition.actions {
            let outcome = catch_unwind(AssertUnwindSafe(|| action.apply(ctx)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(
                    run_id = %ctx.run_id(),
                    action = action.name(),
                    error = %error,
                    "Transition action failed"
                ),
                Err(_) => warn!(
                    run_id = %ctx.run_id(),
                    action = action.name(),
                    "Transition action panicked"
                ),
            }
        }

        let record = TransitionRecord {
            from,
            event,
            to,
            progress_pct,
            timestamp,
        };

        let observers = self.observers.read().clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_transition(&record, ctx))).is_err() {
                warn!(run_id = %ctx.run_id(), event = %event, "Transition observer panicked");
            }
        }

        Ok(record)
    }

    /// Returns true if `event` would be applied to `ctx` right now.
    #[must_use]
    pub fn can_fire(&self, ctx: &RunContext, event: PipelineEvent) -> bool {
        self.check(ctx, event).is_ok()
    }

    /// Returns the events with an entry from the run's current state.
    #[must_use]
    pub fn available_events(&self, ctx: &RunContext) -> Vec<PipelineEvent> {
        self.table.events_from(ctx.current_state())
    }

    fn check(
        &self,
        ctx: &RunContext,
        event: PipelineEvent,
    ) -> Result<&super::Transition, TransitionRejection> {
        let from = ctx.current_state();
        let transition = self
            .table
            .find(from, event)
            .ok_or(TransitionRejection::NoTransition { from, event })?;

        if let Some(failed) = transition.guards.iter().find(|guard| !guard.check(ctx)) {
            return Err(TransitionRejection::GuardFailed {
                from,
                event,
                guard: failed.name().to_string(),
            });
        }
        Ok(transition)
    }
}

impl Default for PipelineStateMachine {
    fn default() -> Self {
        Self::standard(&PhaseRequirements::default())
    }
}

impl std::fmt::Debug for PipelineStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStateMachine")
            .field("transitions", &self.table.len())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::fsm::{Action, Transition};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn requirements() -> PhaseRequirements {
        PhaseRequirements::from_stages(
            "hierarchy",
            [
                ("A", PipelineState::RunningA),
                ("B", PipelineState::RunningB),
                ("C", PipelineState::RunningC),
            ],
        )
    }

    fn run() -> RunContext {
        RunContext::new("owner", json!({"hierarchy": {"title": "doc"}}))
    }

    #[test]
    fn test_happy_path() {
        let fsm = PipelineStateMachine::standard(&requirements());
        let mut ctx = run();

        let record = fsm.transition(&mut ctx, PipelineEvent::Start).unwrap();
        assert_eq!(record.to, PipelineState::RunningA);
        assert_eq!(ctx.progress_pct(), 10);
        assert!(ctx.started_at().is_some());

        ctx.write_checkpoint("A", json!({"nodes": 3}));
        fsm.transition(&mut ctx, PipelineEvent::PhaseADone).unwrap();
        ctx.write_checkpoint("B", json!({"paths": 3}));
        fsm.transition(&mut ctx, PipelineEvent::PhaseBDone).unwrap();
        ctx.write_checkpoint("C", json!({"image": "x.png"}));
        fsm.transition(&mut ctx, PipelineEvent::PhaseCDone).unwrap();

        assert_eq!(ctx.current_state(), PipelineState::Complete);
        assert_eq!(ctx.previous_state(), Some(PipelineState::RunningC));
        assert_eq!(ctx.progress_pct(), 100);
        assert!(ctx.completed_at().is_some());

        let states: Vec<PipelineState> = ctx.event_log().iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                PipelineState::RunningA,
                PipelineState::RunningB,
                PipelineState::RunningC,
                PipelineState::Complete
            ]
        );
    }

    #[test]
    fn test_invalid_transition_is_a_noop() {
        let fsm = PipelineStateMachine::default();
        let mut ctx = run();
        let before = ctx.clone();

        let rejection = fsm
            .transition(&mut ctx, PipelineEvent::PhaseCDone)
            .unwrap_err();

        assert_eq!(rejection.to_string(), "no transition");
        assert_eq!(ctx, before);
    }

    #[test]
    fn test_guard_rejection_names_the_guard() {
        let fsm = PipelineStateMachine::default();
        let mut ctx = RunContext::new("owner", json!({"hierarchy": {}}));
        let before = ctx.clone();

        let rejection = fsm.transition(&mut ctx, PipelineEvent::Start).unwrap_err();

        assert_eq!(rejection.to_string(), "has_input failed");
        assert_eq!(rejection.event(), PipelineEvent::Start);
        assert_eq!(rejection.state(), PipelineState::Idle);
        assert_eq!(ctx, before);
        assert_eq!(ctx.current_state(), PipelineState::Idle);
    }

    #[test]
    fn test_phase_guard_blocks_without_checkpoint() {
        let fsm = PipelineStateMachine::standard(&requirements());
        let mut ctx = run();
        fsm.transition(&mut ctx, PipelineEvent::Start).unwrap();

        let rejection = fsm
            .transition(&mut ctx, PipelineEvent::PhaseADone)
            .unwrap_err();
        assert_eq!(rejection.to_string(), "phase_a_output_valid failed");
        assert_eq!(ctx.current_state(), PipelineState::RunningA);
    }

    #[test]
    fn test_retry_boundary() {
        let fsm = PipelineStateMachine::default();
        let mut ctx = run().with_max_retries(2);
        fsm.transition(&mut ctx, PipelineEvent::Start).unwrap();
        fsm.transition(&mut ctx, PipelineEvent::Error).unwrap();
        ctx.set_retry_count(2);

        let rejection = fsm.transition(&mut ctx, PipelineEvent::Retry).unwrap_err();
        assert_eq!(rejection.to_string(), "can_retry failed");
        assert_eq!(ctx.current_state(), PipelineState::Failed);
        assert_eq!(ctx.retry_count(), 2);
    }

    #[test]
    fn test_retry_increments_and_clears_error() {
        let fsm = PipelineStateMachine::default();
        let mut ctx = run();
        fsm.transition(&mut ctx, PipelineEvent::Start).unwrap();
        ctx.record_error("B failed", Some(ErrorCode::StageProcessingFailed));
        fsm.transition(&mut ctx, PipelineEvent::Error).unwrap();
        assert!(ctx.completed_at().is_some());

        fsm.transition(&mut ctx, PipelineEvent::Retry).unwrap();

        assert_eq!(ctx.current_state(), PipelineState::RunningA);
        assert_eq!(ctx.retry_count(), 1);
        assert!(ctx.error_message().is_none());
        assert!(ctx.completed_at().is_none());
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let fsm = PipelineStateMachine::default();
        let mut ctx = run();
        fsm.transition(&mut ctx, PipelineEvent::Start).unwrap();
        ctx.write_checkpoint("A", json!(1));
        fsm.transition(&mut ctx, PipelineEvent::Cancel).unwrap();
        assert_eq!(ctx.progress_pct(), 0);

        fsm.transition(&mut ctx, PipelineEvent::Reset).unwrap();

        assert_eq!(ctx.current_state(), PipelineState::Idle);
        assert!(ctx.checkpoints().is_empty());
        assert!(ctx.started_at().is_none());
        assert_eq!(ctx.event_log().len(), 3);
    }

    #[test]
    fn test_idle_run_can_be_cancelled() {
        let fsm = PipelineStateMachine::default();
        let mut ctx = run();
        fsm.transition(&mut ctx, PipelineEvent::Cancel).unwrap();
        assert_eq!(ctx.current_state(), PipelineState::Cancelled);
    }

    #[test]
    fn test_failing_action_does_not_roll_back() {
        let table = TransitionTable::new().with(
            Transition::new(PipelineState::Idle, PipelineEvent::Start, PipelineState::RunningA)
                .action(Action::new("explode", |_| Err("nope".to_string())))
                .action(Action::new("panics", |_| panic!("action bug"))),
        );
        let fsm = PipelineStateMachine::new(table);
        let mut ctx = run();

        let record = fsm.transition(&mut ctx, PipelineEvent::Start).unwrap();

        assert_eq!(record.to, PipelineState::RunningA);
        assert_eq!(ctx.current_state(), PipelineState::RunningA);
    }

    #[test]
    fn test_observers_are_notified() {
        let fsm = PipelineStateMachine::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        fsm.add_observer(Arc::new(move |record: &TransitionRecord, _: &RunContext| {
            assert_eq!(record.event, PipelineEvent::Start);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut ctx = run();
        fsm.transition(&mut ctx, PipelineEvent::Start).unwrap();
        let _ = fsm.transition(&mut ctx, PipelineEvent::Start);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_can_fire_and_available_events() {
        let fsm = PipelineStateMachine::default();
        let ctx = run();
        let before = ctx.clone();

        assert!(fsm.can_fire(&ctx, PipelineEvent::Start));
        assert!(!fsm.can_fire(&ctx, PipelineEvent::Retry));
        assert_eq!(
            fsm.available_events(&ctx),
            vec![PipelineEvent::Start, PipelineEvent::Cancel]
        );
        assert_eq!(ctx, before);
    }
}
