//! Run and execution contexts.
//!
//! This module provides:
//! - [`RunContext`], the per-run record the state machine and coordinator mutate
//! - [`ExecutionContext`], the per-invocation view handed to a stage

mod execution;
mod run;

pub use execution::{ExecutionContext, StageScope};
pub use run::{EventLogEntry, RunContext, DEFAULT_MAX_RETRIES};
