//! Shared envelope fields carried by every protocol message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// The kind of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A stage invocation request.
    Request,
    /// The answer to a request.
    Response,
    /// A progress notification.
    Progress,
    /// An error notification.
    Error,
    /// A cancellation notification.
    Cancel,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Progress => write!(f, "progress"),
            Self::Error => write!(f, "error"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Delivery priority of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Latency-sensitive work.
    High,
    /// Must be handled before anything else.
    Critical,
}

/// Identity, routing and bookkeeping fields common to all messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique identity of this message.
    pub message_id: Uuid,
    /// Identity of the message this one belongs to.
    pub correlation_id: Uuid,
    /// Name of the sender.
    #[serde(default)]
    pub source: String,
    /// Name of the intended receiver.
    #[serde(default)]
    pub target: String,
    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
    /// Arbitrary caller metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the message was constructed.
    pub timestamp: DateTime<Utc>,
}

impl MessageHeader {
    /// Creates a header with a fresh identity that correlates to itself.
    #[must_use]
    pub fn new() -> Self {
        let message_id = Uuid::new_v4();
        Self {
            message_id,
            correlation_id: message_id,
            source: String::new(),
            target: String::new(),
            priority: Priority::Normal,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a header with a fresh identity correlated to `correlation_id`.
    #[must_use]
    pub fn correlated(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            ..Self::new()
        }
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}
