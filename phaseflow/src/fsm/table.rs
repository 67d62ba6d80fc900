//! The static transition table.

use super::{Action, Guard, PhaseRequirements, PipelineEvent, PipelineState};

/// One `(from, event) -> to` entry.
#[derive(Debug, Clone)]
pub struct Transition {
    /// State the run must be in.
    pub from: PipelineState,
    /// Triggering event.
    pub event: PipelineEvent,
    /// State the run enters.
    pub to: PipelineState,
    /// Evaluated in order; all must pass.
    pub guards: Vec<Guard>,
    /// Run in order after the transition commits.
    pub actions: Vec<Action>,
}

impl Transition {
    /// Creates an unguarded transition with no actions.
    #[must_use]
    pub const fn new(from: PipelineState, event: PipelineEvent, to: PipelineState) -> Self {
        Self {
            from,
            event,
            to,
            guards: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Appends a guard.
    #[must_use]
    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    /// Appends an action.
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Returns the guard names in evaluation order.
    #[must_use]
    pub fn guard_names(&self) -> Vec<&str> {
        self.guards.iter().map(Guard::name).collect()
    }
}

/// Progress reported for a run in `state`.
#[must_use]
pub const fn progress_for(state: PipelineState) -> u8 {
    match state {
        PipelineState::Idle | PipelineState::Failed | PipelineState::Cancelled => 0,
        PipelineState::RunningA => 10,
        PipelineState::RunningB => 40,
        PipelineState::RunningC => 70,
        PipelineState::Complete => 100,
    }
}

/// An inspectable set of transitions with at most one entry per
/// `(from, event)` pair.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    transitions: Vec<Transition>,
}

impl TransitionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard run lifecycle.
    #[must_use]
    pub fn standard(requirements: &PhaseRequirements) -> Self {
        use PipelineEvent::{Cancel, Error, PhaseADone, PhaseBDone, PhaseCDone, Reset, Retry, Start};
        use PipelineState::{Cancelled, Complete, Failed, Idle, RunningA, RunningB, RunningC};

        let mut table = Self::new()
            .with(Transition::new(Idle, Start, RunningA).guard(Guard::has_input(&requirements.input_key)))
            .with(Transition::new(Idle, Cancel, Cancelled))
            .with(Transition::new(RunningA, PhaseADone, RunningB).guard(requirements.phase_a_guard()))
            .with(Transition::new(RunningB, PhaseBDone, RunningC).guard(requirements.phase_b_guard()))
            .with(Transition::new(RunningC, PhaseCDone, Complete).guard(requirements.phase_c_guard()));

        for running in PipelineState::RUNNING {
            table = table
                .with(Transition::new(running, Error, Failed))
                .with(Transition::new(running, Cancel, Cancelled));
        }

        table
            .with(
                Transition::new(Failed, Retry, RunningA)
                    .guard(Guard::can_retry())
                    .action(Action::increment_retry()),
            )
            .with(Transition::new(Failed, Reset, Idle).action(Action::reset_run()))
            .with(Transition::new(Cancelled, Reset, Idle).action(Action::reset_run()))
            .with(Transition::new(Complete, Reset, Idle).action(Action::reset_run()))
    }

    /// Adds `transition`, replacing any entry for the same `(from, event)`.
    #[must_use]
    pub fn with(mut self, transition: Transition) -> Self {
        self.insert(transition);
        self
    }

    /// Adds `transition`, replacing any entry for the same `(from, event)`.
    pub fn insert(&mut self, transition: Transition) {
        match self
            .transitions
            .iter_mut()
            .find(|t| t.from == transition.from && t.event == transition.event)
        {
            Some(existing) => *existing = transition,
            None => self.transitions.push(transition),
        }
    }

    /// Finds the entry for `(from, event)`.
    #[must_use]
    pub fn find(&self, from: PipelineState, event: PipelineEvent) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
    }

    /// Returns all entries in insertion order.
    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Returns the events with an entry from `state`, guards aside.
    #[must_use]
    pub fn events_from(&self, state: PipelineState) -> Vec<PipelineEvent> {
        PipelineEvent::ALL
            .into_iter()
            .filter(|event| self.find(state, *event).is_some())
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Returns true if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_standard_table_shape() {
        let table = TransitionTable::standard(&PhaseRequirements::default());
        assert_eq!(table.len(), 15);

        let start = table
            .find(PipelineState::Idle, PipelineEvent::Start)
            .unwrap();
        assert_eq!(start.to, PipelineState::RunningA);
        assert_eq!(start.guard_names(), vec!["has_input"]);

        let b_done = table
            .find(PipelineState::RunningB, PipelineEvent::PhaseBDone)
            .unwrap();
        assert_eq!(b_done.guard_names(), vec!["phase_b_checkpoints_present"]);

        let retry = table
            .find(PipelineState::Failed, PipelineEvent::Retry)
            .unwrap();
        assert_eq!(retry.guard_names(), vec!["can_retry"]);
        assert_eq!(retry.actions[0].name(), "increment_retry");

        assert!(table
            .find(PipelineState::Complete, PipelineEvent::Start)
            .is_none());
    }

    #[test]
    fn test_events_from() {
        let table = TransitionTable::standard(&PhaseRequirements::default());
        assert_eq!(
            table.events_from(PipelineState::RunningA),
            vec![PipelineEvent::PhaseADone, PipelineEvent::Error, PipelineEvent::Cancel]
        );
        assert_eq!(
            table.events_from(PipelineState::Failed),
            vec![PipelineEvent::Retry, PipelineEvent::Reset]
        );
    }

    #[test]
    fn test_insert_replaces_same_pair() {
        let mut table = TransitionTable::new();
        table.insert(Transition::new(
            PipelineState::Idle,
            PipelineEvent::Start,
            PipelineState::RunningA,
        ));
        table.insert(Transition::new(
            PipelineState::Idle,
            PipelineEvent::Start,
            PipelineState::RunningB,
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(
            table
                .find(PipelineState::Idle, PipelineEvent::Start)
                .map(|t| t.to),
            Some(PipelineState::RunningB)
        );
    }

    #[test]
    fn test_progress_is_monotonic_along_forward_path() {
        let path = [
            PipelineState::Idle,
            PipelineState::RunningA,
            PipelineState::RunningB,
            PipelineState::RunningC,
            PipelineState::Complete,
        ];
        for pair in path.windows(2) {
            assert!(progress_for(pair[0]) <= progress_for(pair[1]));
        }
        assert_eq!(progress_for(PipelineState::Complete), 100);
        assert_eq!(progress_for(PipelineState::Cancelled), 0);
    }
}
