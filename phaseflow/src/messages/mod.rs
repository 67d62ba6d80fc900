//! Typed message protocol.
//!
//! Immutable envelopes exchanged between the coordinator, stages and
//! whatever listens to a run:
//! - [`Request`] / [`Response`] for stage invocation
//! - [`ProgressUpdate`], [`ErrorMessage`], [`CancelMessage`] push notifications

mod envelope;
mod notifications;
mod request;
mod response;

pub use envelope::{MessageHeader, MessageType, Priority};
pub use notifications::{CancelMessage, ErrorMessage, ProgressUpdate, Severity};
pub use request::{Request, RequestBuilder};
pub use response::{ResourceUsage, Response};

use serde::{Deserialize, Serialize};

/// Any protocol message, tagged by its `message_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Message {
    /// A stage invocation request.
    Request(Request),
    /// A stage response.
    Response(Response),
    /// A progress notification.
    Progress(ProgressUpdate),
    /// An error notification.
    Error(ErrorMessage),
    /// A cancellation notification.
    Cancel(CancelMessage),
}

impl Message {
    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::Progress(_) => MessageType::Progress,
            Self::Error(_) => MessageType::Error,
            Self::Cancel(_) => MessageType::Cancel,
        }
    }

    /// Returns the envelope header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        match self {
            Self::Request(m) => m.header(),
            Self::Response(m) => m.header(),
            Self::Progress(m) => &m.header,
            Self::Error(m) => &m.header,
            Self::Cancel(m) => &m.header,
        }
    }
}

impl From<ProgressUpdate> for Message {
    fn from(m: ProgressUpdate) -> Self {
        Self::Progress(m)
    }
}

impl From<ErrorMessage> for Message {
    fn from(m: ErrorMessage) -> Self {
        Self::Error(m)
    }
}

impl From<CancelMessage> for Message {
    fn from(m: CancelMessage) -> Self {
        Self::Cancel(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use uuid::Uuid;

    #[test]
    fn test_message_tag_on_wire() {
        let msg: Message = ProgressUpdate::new(Uuid::new_v4(), 10, "started").into();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["message_type"], serde_json::json!("progress"));
        assert_eq!(msg.message_type(), MessageType::Progress);
    }

    #[test]
    fn test_message_round_trip() {
        let msg: Message =
            ErrorMessage::new(Uuid::new_v4(), ErrorCode::StageTimeout, "late", true).into();
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_type(), MessageType::Error);
        assert_eq!(back.header().message_id, msg.header().message_id);
    }
}
