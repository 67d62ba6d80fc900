//! Stage-side errors and their classification.

use crate::errors::ErrorCode;
use thiserror::Error;

/// An error produced while a stage runs.
///
/// Errors never escape [`crate::stages::StageRunner::run`]; they are
/// classified here and turned into a failed response plus an error
/// notification.
#[derive(Debug, Error)]
pub enum StageError {
    /// The request payload could not be parsed into the stage's input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation inside the stage timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An external resource could not be reached.
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// Cancellation was observed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The stage's own logic failed.
    #[error("Processing failed: {0}")]
    Processing(String),

    /// The stage panicked.
    #[error("Stage panicked: {0}")]
    Panicked(String),

    /// Any other error raised by stage code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Creates a processing error.
    #[must_use]
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Creates a resource-unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Returns true for timeout- and connectivity-class errors.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Other(err) => is_transient_source(err),
            Self::InvalidInput(_) | Self::Cancelled(_) | Self::Processing(_) | Self::Panicked(_) => {
                false
            }
        }
    }

    /// Maps the error onto the client-facing code taxonomy.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::ResourceTimeout,
            Self::Unavailable(_) => ErrorCode::ResourceUnavailable,
            Self::Cancelled(_) => ErrorCode::PipelineCancelled,
            Self::Other(err) if is_transient_source(err) => ErrorCode::ResourceUnavailable,
            Self::InvalidInput(_) | Self::Processing(_) | Self::Panicked(_) | Self::Other(_) => {
                ErrorCode::StageProcessingFailed
            }
        }
    }
}

/// Looks through an opaque error chain for timeout or connectivity causes.
fn is_transient_source(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        cause.downcast_ref::<std::io::Error>().is_some_and(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
            )
        })
    })
}
