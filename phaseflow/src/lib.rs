//! # Phaseflow
//!
//! Multi-stage document pipeline orchestration.
//!
//! A run moves through three ordered phases (`running_a`, `running_b`,
//! `running_c`) under an explicit finite state machine. Each phase executes
//! one or more independently implemented stages; every stage output is
//! checkpointed on the run so a failed run can resume where it stopped.
//!
//! - **State machine**: guarded transitions, per-state progress, observers
//! - **Stages**: typed [`stages::Stage`] implementations with lifecycle
//!   hooks, cancellation checks and usage accounting
//! - **Coordinator**: per-stage timeouts, bounded retries with backoff,
//!   snapshot persistence and resume
//! - **Messages**: request/response envelopes plus progress, error and
//!   cancel notifications
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use phaseflow::prelude::*;
//! use serde_json::json;
//!
//! let config = CoordinatorConfig::new(vec![
//!     StageConfig::new("parse", PipelineState::RunningA).requires("hierarchy"),
//!     StageConfig::new("generate", PipelineState::RunningB).requires("parse"),
//!     StageConfig::new("render", PipelineState::RunningC).requires("generate"),
//! ]);
//! let registry = Arc::new(
//!     StageRegistry::new()
//!         .with_stage(ParseStage::new())
//!         .with_stage(GenerateStage::new())
//!         .with_stage(RenderStage::new()),
//! );
//!
//! let coordinator = StageCoordinator::new(config, registry)?;
//! let mut run = coordinator.create_run("owner-1", json!({"hierarchy": {"title": "Q3"}}));
//! let result = coordinator.execute(&mut run).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod context;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod fsm;
pub mod messages;
pub mod observability;
pub mod repository;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancelHandle, CancellationToken};
    pub use crate::context::{ExecutionContext, RunContext, StageScope};
    pub use crate::coordinator::{
        CoordinatorConfig, CoordinatorResult, RetryConfig, StageConfig, StageCoordinator,
        StageRegistry, StageResult,
    };
    pub use crate::errors::{ConfigError, ErrorCode, PhaseflowError};
    pub use crate::events::{LoggingMessageSink, MessageSink, NoOpMessageSink};
    pub use crate::fsm::{
        PipelineEvent, PipelineState, PipelineStateMachine, TransitionRecord, TransitionRejection,
    };
    pub use crate::messages::{
        CancelMessage, ErrorMessage, ProgressUpdate, Request, ResourceUsage, Response, Severity,
    };
    pub use crate::repository::{InMemoryRunStateRepository, RunStateRepository};
    pub use crate::stages::{FnStage, Stage, StageError, StageExecutor, StageRunner};
    pub use std::sync::Arc;
}
