//! Stage instance status and accumulated metrics.

use crate::messages::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a stage instance is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Never run, or ready for the next request.
    #[default]
    Idle,
    /// A request is being served.
    Processing,
    /// The last request succeeded.
    Completed,
    /// The last request failed.
    Failed,
    /// The last request observed cancellation.
    Cancelled,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Counters accumulated across all invocations of one stage instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Requests served.
    pub invocations: u64,
    /// Successful responses.
    pub successes: u64,
    /// Failed responses.
    pub failures: u64,
    /// Cancelled responses.
    pub cancellations: u64,
    /// Sum of elapsed times, in milliseconds.
    pub total_elapsed_ms: f64,
    /// Resource usage summed over all invocations.
    pub usage: ResourceUsage,
}

impl StageMetrics {
    /// Total tokens consumed.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.usage.tokens
    }

    /// Mean elapsed time per invocation.
    #[must_use]
    pub fn mean_elapsed_ms(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = self.invocations as f64;
        self.total_elapsed_ms / count
    }

    pub(crate) fn record(&mut self, status: StageStatus, elapsed_ms: f64, usage: &ResourceUsage) {
        self.invocations += 1;
        match status {
            StageStatus::Completed => self.successes += 1,
            StageStatus::Cancelled => self.cancellations += 1,
            StageStatus::Failed | StageStatus::Idle | StageStatus::Processing => {
                self.failures += 1;
            }
        }
        self.total_elapsed_ms += elapsed_ms;
        self.usage.merge(usage);
    }
}
