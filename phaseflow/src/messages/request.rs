//! Stage invocation requests.

use super::{MessageHeader, MessageType, Priority};
use crate::errors::PhaseflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// An immutable request asking one stage to process one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    header: MessageHeader,
    run_id: Uuid,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    context: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<f64>,
    attempt: u32,
    max_attempts: u32,
}

impl Request {
    /// The fixed message type of requests.
    pub const MESSAGE_TYPE: MessageType = MessageType::Request;

    /// Starts building a request for `target` within run `run_id`.
    #[must_use]
    pub fn builder(run_id: Uuid, target: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(run_id, target)
    }

    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        Self::MESSAGE_TYPE
    }

    /// Returns the identity of this request.
    #[must_use]
    pub const fn message_id(&self) -> Uuid {
        self.header.message_id
    }

    /// Returns the correlation id.
    #[must_use]
    pub const fn correlation_id(&self) -> Uuid {
        self.header.correlation_id
    }

    /// Returns the full envelope header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Returns the sender name.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.header.source
    }

    /// Returns the target stage name.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.header.target
    }

    /// Returns the priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.header.priority
    }

    /// Returns the caller metadata.
    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.header.metadata
    }

    /// Returns the construction timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.header.timestamp
    }

    /// Returns the run this request belongs to.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the input payload.
    #[must_use]
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Returns the checkpoints inherited from earlier stages.
    #[must_use]
    pub const fn context(&self) -> &HashMap<String, serde_json::Value> {
        &self.context
    }

    /// Returns the per-attempt timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the attempt bound.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Builder for [`Request`]; validation happens in [`RequestBuilder::build`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    header: MessageHeader,
    run_id: Uuid,
    payload: serde_json::Value,
    context: HashMap<String, serde_json::Value>,
    timeout_seconds: Option<f64>,
    attempt: u32,
    max_attempts: u32,
}

impl RequestBuilder {
    fn new(run_id: Uuid, target: impl Into<String>) -> Self {
        Self {
            header: MessageHeader::new().with_target(target),
            run_id,
            payload: serde_json::Value::Null,
            context: HashMap::new(),
            timeout_seconds: None,
            attempt: 1,
            max_attempts: 1,
        }
    }

    /// Sets the sender name.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.header.source = source.into();
        self
    }

    /// Sets an explicit correlation id.
    #[must_use]
    pub const fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.header.correlation_id = correlation_id;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.header.metadata.insert(key.into(), value);
        self
    }

    /// Sets the input payload.
    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the inherited checkpoints.
    #[must_use]
    pub fn context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    /// Sets the attempt bookkeeping.
    #[must_use]
    pub const fn attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseflowError::InvalidMessage`] when the target is empty,
    /// the run id is nil, or the attempt bookkeeping is inconsistent.
    pub fn build(self) -> Result<Request, PhaseflowError> {
        if self.header.target.trim().is_empty() {
            return Err(PhaseflowError::InvalidMessage(
                "request target cannot be empty".to_string(),
            ));
        }
        if self.run_id.is_nil() {
            return Err(PhaseflowError::InvalidMessage(
                "request run_id cannot be nil".to_string(),
            ));
        }
        if self.attempt == 0 || self.attempt > self.max_attempts {
            return Err(PhaseflowError::InvalidMessage(format!(
                "attempt {} is outside 1..={}",
                self.attempt, self.max_attempts
            )));
        }
        if matches!(self.timeout_seconds, Some(t) if t <= 0.0) {
            return Err(PhaseflowError::InvalidMessage(
                "timeout must be positive when provided".to_string(),
            ));
        }

        Ok(Request {
            header: self.header,
            run_id: self.run_id,
            payload: self.payload,
            context: self.context,
            timeout_seconds: self.timeout_seconds,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
        })
    }
}
