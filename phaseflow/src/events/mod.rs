//! Progress and error callbacks.
//!
//! Stages and the coordinator push protocol notifications into a
//! [`MessageSink`]. Callers forward them wherever they like (logs, a
//! message bus, a push channel).

mod sink;

pub use sink::{CollectingMessageSink, LoggingMessageSink, MessageSink, NoOpMessageSink};

use std::sync::Arc;

/// Returns the sink used when none is configured.
#[must_use]
pub fn default_sink() -> Arc<dyn MessageSink> {
    Arc::new(LoggingMessageSink::default())
}
