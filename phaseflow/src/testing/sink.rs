//! Recording sink.

use crate::cancellation::CancellationToken;
use crate::events::{CollectingMessageSink, MessageSink};
use crate::messages::{CancelMessage, ErrorMessage, ProgressUpdate};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

/// A [`CollectingMessageSink`] that can also cancel a run once run-level
/// progress reaches a threshold.
#[derive(Debug, Default)]
pub struct RecordingSink {
    inner: CollectingMessageSink,
    trigger: Mutex<Option<(u8, Arc<CancellationToken>)>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels `token` the first time run-level progress reaches `percent`.
    #[must_use]
    pub fn cancel_at(self, percent: u8, token: Arc<CancellationToken>) -> Self {
        *self.trigger.lock() = Some((percent, token));
        self
    }

    /// Run-level progress percentages, in arrival order.
    #[must_use]
    pub fn run_progress(&self) -> Vec<u8> {
        self.inner
            .progress()
            .into_iter()
            .filter(|p| p.stage.is_none())
            .map(|p| p.percent)
            .collect()
    }
}

impl Deref for RecordingSink {
    type Target = CollectingMessageSink;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl MessageSink for RecordingSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        self.inner.on_progress(update);
        if update.stage.is_some() {
            return;
        }
        let mut trigger = self.trigger.lock();
        if trigger.as_ref().is_some_and(|(at, _)| update.percent >= *at) {
            if let Some((at, token)) = trigger.take() {
                token.cancel(format!("progress reached {at}%"));
            }
        }
    }

    fn on_error(&self, error: &ErrorMessage) {
        self.inner.on_error(error);
    }

    fn on_cancel(&self, cancel: &CancelMessage) {
        self.inner.on_cancel(cancel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_cancel_at_threshold_fires_once() {
        let token = CancellationToken::shared();
        let sink = RecordingSink::new().cancel_at(40, token.clone());
        let run_id = Uuid::new_v4();

        sink.on_progress(&ProgressUpdate::new(run_id, 10, "a"));
        assert!(!token.is_cancelled());

        sink.on_progress(&ProgressUpdate::new(run_id, 50, "stage").for_stage("parse"));
        assert!(!token.is_cancelled());

        sink.on_progress(&ProgressUpdate::new(run_id, 40, "b"));
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("progress reached 40%"));
        assert_eq!(sink.run_progress(), vec![10, 40]);
        assert_eq!(sink.len(), 3);
    }
}
