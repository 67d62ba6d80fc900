//! Run lifecycle state machine.
//!
//! An explicit table of `(state, event) -> (state, guards, actions)` plus a
//! progress percentage per state. Pure transition logic over a
//! [`crate::context::RunContext`].

mod actions;
mod guards;
mod machine;
mod states;
mod table;

pub use actions::Action;
pub use guards::{is_non_empty, Guard, PhaseRequirements, DEFAULT_INPUT_KEY};
pub use machine::{PipelineStateMachine, TransitionObserver, TransitionRecord, TransitionRejection};
pub use states::{PipelineEvent, PipelineState};
pub use table::{progress_for, Transition, TransitionTable};
