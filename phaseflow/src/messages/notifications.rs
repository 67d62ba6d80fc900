//! Push notifications correlated to a run.

use super::{MessageHeader, MessageType};
use crate::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How serious an error notification is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Degraded but continuing, e.g. a failed attempt that will be retried.
    Warning,
    /// The operation failed.
    #[default]
    Error,
    /// The run cannot continue.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Reports how far a run (or a stage within it) has progressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Envelope.
    #[serde(flatten)]
    pub header: MessageHeader,
    /// The run being reported on.
    pub run_id: Uuid,
    /// The stage being reported on, if stage-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Percentage complete, 0..=100.
    pub percent: u8,
    /// Human-readable status line.
    #[serde(default)]
    pub message: String,
}

impl ProgressUpdate {
    /// The fixed message type of progress updates.
    pub const MESSAGE_TYPE: MessageType = MessageType::Progress;

    /// Creates a progress update; `percent` is clamped to 100.
    #[must_use]
    pub fn new(run_id: Uuid, percent: u8, message: impl Into<String>) -> Self {
        Self {
            header: MessageHeader::correlated(run_id),
            run_id,
            stage: None,
            percent: percent.min(100),
            message: message.into(),
        }
    }

    /// Scopes the update to a stage.
    #[must_use]
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        let stage = stage.into();
        self.header.source.clone_from(&stage);
        self.stage = Some(stage);
        self
    }

    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        Self::MESSAGE_TYPE
    }
}

/// Reports a failure together with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Envelope.
    #[serde(flatten)]
    pub header: MessageHeader,
    /// The run the error belongs to.
    pub run_id: Uuid,
    /// The stage that failed, if stage-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Severity.
    pub severity: Severity,
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable error text.
    pub message: String,
    /// Whether resubmitting is likely to help.
    pub recoverable: bool,
    /// The attempt that failed, when produced by a retry loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl ErrorMessage {
    /// The fixed message type of error notifications.
    pub const MESSAGE_TYPE: MessageType = MessageType::Error;

    /// Creates an error notification with [`Severity::Error`].
    #[must_use]
    pub fn new(
        run_id: Uuid,
        code: ErrorCode,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            header: MessageHeader::correlated(run_id),
            run_id,
            stage: None,
            severity: Severity::Error,
            code,
            message: message.into(),
            recoverable,
            attempt: None,
        }
    }

    /// Scopes the error to a stage.
    #[must_use]
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        let stage = stage.into();
        self.header.source.clone_from(&stage);
        self.stage = Some(stage);
        self
    }

    /// Sets the severity.
    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Records the failed attempt number.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        Self::MESSAGE_TYPE
    }
}

/// Announces that a run was cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelMessage {
    /// Envelope.
    #[serde(flatten)]
    pub header: MessageHeader,
    /// The cancelled run.
    pub run_id: Uuid,
    /// Why the run was cancelled.
    pub reason: String,
    /// The stage that observed the cancellation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl CancelMessage {
    /// The fixed message type of cancel notifications.
    pub const MESSAGE_TYPE: MessageType = MessageType::Cancel;

    /// Creates a cancel notification.
    #[must_use]
    pub fn new(run_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            header: MessageHeader::correlated(run_id),
            run_id,
            reason: reason.into(),
            stage: None,
        }
    }

    /// Scopes the notification to a stage.
    #[must_use]
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        Self::MESSAGE_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_clamped() {
        let update = ProgressUpdate::new(Uuid::new_v4(), 250, "overflow");
        assert_eq!(update.percent, 100);
        assert_eq!(update.message_type(), MessageType::Progress);
    }

    #[test]
    fn test_progress_correlates_to_run() {
        let run_id = Uuid::new_v4();
        let update = ProgressUpdate::new(run_id, 40, "phase b").for_stage("layout");
        assert_eq!(update.header.correlation_id, run_id);
        assert_eq!(update.stage.as_deref(), Some("layout"));
        assert_eq!(update.header.source, "layout");
    }

    #[test]
    fn test_error_message_builder() {
        let msg = ErrorMessage::new(Uuid::new_v4(), ErrorCode::StageTimeout, "slow", true)
            .for_stage("render")
            .with_severity(Severity::Warning)
            .with_attempt(2);

        assert_eq!(msg.severity, Severity::Warning);
        assert_eq!(msg.attempt, Some(2));
        assert!(msg.recoverable);
        assert_eq!(msg.message_type(), MessageType::Error);
    }

    #[test]
    fn test_error_message_serialization() {
        let msg = ErrorMessage::new(Uuid::new_v4(), ErrorCode::AgentNotFound, "missing", false);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["code"], serde_json::json!("AGENT_NOT_FOUND"));
        assert_eq!(value["severity"], serde_json::json!("error"));
    }

    #[test]
    fn test_cancel_message() {
        let run_id = Uuid::new_v4();
        let msg = CancelMessage::new(run_id, "shutdown").for_stage("parse");
        assert_eq!(msg.run_id, run_id);
        assert_eq!(msg.reason, "shutdown");
        assert_eq!(msg.message_type(), MessageType::Cancel);
    }
}
