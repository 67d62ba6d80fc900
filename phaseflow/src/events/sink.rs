//! Message sink trait and implementations.

use crate::messages::{CancelMessage, ErrorMessage, Message, ProgressUpdate, Severity};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn, Level};

/// Receives protocol notifications emitted during a run.
///
/// Callbacks are invoked synchronously on the run's task, so they must
/// return quickly and never block. Every method defaults to a no-op.
pub trait MessageSink: Send + Sync {
    /// Called for every progress update.
    fn on_progress(&self, _update: &ProgressUpdate) {}

    /// Called for every error notification.
    fn on_error(&self, _error: &ErrorMessage) {}

    /// Called when a run or stage observes cancellation.
    fn on_cancel(&self, _cancel: &CancelMessage) {}
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMessageSink;

impl MessageSink for NoOpMessageSink {}

/// A sink that forwards notifications to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingMessageSink {
    progress_level: Level,
}

impl Default for LoggingMessageSink {
    fn default() -> Self {
        Self {
            progress_level: Level::INFO,
        }
    }
}

impl LoggingMessageSink {
    /// Creates a sink that logs progress at `progress_level`.
    #[must_use]
    pub const fn new(progress_level: Level) -> Self {
        Self { progress_level }
    }

    /// Creates a sink that logs progress at debug level.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl MessageSink for LoggingMessageSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        if self.progress_level == Level::DEBUG {
            debug!(
                run_id = %update.run_id,
                stage = ?update.stage,
                percent = update.percent,
                "{}", update.message
            );
        } else {
            info!(
                run_id = %update.run_id,
                stage = ?update.stage,
                percent = update.percent,
                "{}", update.message
            );
        }
    }

    fn on_error(&self, err: &ErrorMessage) {
        match err.severity {
            Severity::Warning => warn!(
                run_id = %err.run_id,
                stage = ?err.stage,
                code = %err.code,
                recoverable = err.recoverable,
                attempt = ?err.attempt,
                "{}", err.message
            ),
            Severity::Error | Severity::Critical => error!(
                run_id = %err.run_id,
                stage = ?err.stage,
                code = %err.code,
                severity = %err.severity,
                recoverable = err.recoverable,
                "{}", err.message
            ),
        }
    }

    fn on_cancel(&self, cancel: &CancelMessage) {
        info!(
            run_id = %cancel.run_id,
            stage = ?cancel.stage,
            reason = %cancel.reason,
            "Run cancelled"
        );
    }
}

/// A sink that keeps every notification, in arrival order.
#[derive(Debug, Default)]
pub struct CollectingMessageSink {
    messages: RwLock<Vec<Message>>,
}

impl CollectingMessageSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected messages.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    /// Returns the collected progress updates.
    #[must_use]
    pub fn progress(&self) -> Vec<ProgressUpdate> {
        self.messages
            .read()
            .iter()
            .filter_map(|m| match m {
                Message::Progress(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the collected error notifications.
    #[must_use]
    pub fn errors(&self) -> Vec<ErrorMessage> {
        self.messages
            .read()
            .iter()
            .filter_map(|m| match m {
                Message::Error(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the collected cancel notifications.
    #[must_use]
    pub fn cancellations(&self) -> Vec<CancelMessage> {
        self.messages
            .read()
            .iter()
            .filter_map(|m| match m {
                Message::Cancel(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the number of collected messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Clears all collected messages.
    pub fn clear(&self) {
        self.messages.write().clear();
    }
}

impl MessageSink for CollectingMessageSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        self.messages.write().push(Message::Progress(update.clone()));
    }

    fn on_error(&self, error: &ErrorMessage) {
        self.messages.write().push(Message::Error(error.clone()));
    }

    fn on_cancel(&self, cancel: &CancelMessage) {
        self.messages.write().push(Message::Cancel(cancel.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use uuid::Uuid;

    #[test]
    fn test_noop_sink() {
        let sink = NoOpMessageSink;
        sink.on_progress(&ProgressUpdate::new(Uuid::new_v4(), 0, "x"));
        sink.on_cancel(&CancelMessage::new(Uuid::new_v4(), "x"));
    }

    #[test]
    fn test_logging_sink() {
        let sink = LoggingMessageSink::debug();
        let run_id = Uuid::new_v4();
        sink.on_progress(&ProgressUpdate::new(run_id, 10, "phase a"));
        sink.on_error(
            &ErrorMessage::new(run_id, ErrorCode::StageTimeout, "slow", true)
                .with_severity(Severity::Warning),
        );
        sink.on_error(&ErrorMessage::new(run_id, ErrorCode::AgentNotFound, "gone", false));
    }

    #[test]
    fn test_collecting_sink_keeps_order_and_kinds() {
        let sink = CollectingMessageSink::new();
        assert!(sink.is_empty());

        let run_id = Uuid::new_v4();
        sink.on_progress(&ProgressUpdate::new(run_id, 10, "a"));
        sink.on_error(&ErrorMessage::new(run_id, ErrorCode::StageTimeout, "b", true));
        sink.on_cancel(&CancelMessage::new(run_id, "c"));
        sink.on_progress(&ProgressUpdate::new(run_id, 40, "d"));

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.progress().len(), 2);
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(sink.cancellations().len(), 1);
        assert_eq!(sink.progress()[1].percent, 40);

        sink.clear();
        assert!(sink.is_empty());
    }
}
