//! Test doubles for stages and sinks.
//!
//! [`ScriptedStage`] plays back a fixed sequence of outcomes, one per
//! invocation. [`RecordingSink`] keeps every notification and can cancel a
//! run once progress reaches a threshold.

mod sink;
mod stage;

pub use sink::RecordingSink;
pub use stage::{ScriptedStage, Step};
