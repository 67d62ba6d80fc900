//! Stage coordination.
//!
//! [`StageCoordinator`] fires state machine events around stage groups,
//! validates declared inputs, retries failed attempts with backoff,
//! checkpoints outputs and snapshots the run into a repository.

mod config;
mod engine;
mod registry;
mod result;
mod retry;

pub use config::{CoordinatorConfig, StageConfig, DEFAULT_STAGE_ATTEMPTS, DEFAULT_STAGE_TIMEOUT};
pub use engine::StageCoordinator;
pub use registry::StageRegistry;
pub use result::{CoordinatorResult, StageResult};
pub use retry::{Backoff, BackoffStrategy, JitterStrategy, RetryConfig};
