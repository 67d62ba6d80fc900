//! Stage responses and resource accounting.

use super::{MessageHeader, MessageType, Request};
use crate::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Usage accounting for resource-consuming calls made by a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Number of resource calls issued.
    pub calls: u32,
    /// Units consumed (e.g. tokens).
    pub tokens: u64,
    /// Accumulated latency of the calls, in milliseconds.
    pub latency_ms: f64,
}

impl ResourceUsage {
    /// Usage of a single call.
    #[must_use]
    pub const fn single(tokens: u64, latency_ms: f64) -> Self {
        Self {
            calls: 1,
            tokens,
            latency_ms,
        }
    }

    /// Adds another usage record onto this one.
    pub fn merge(&mut self, other: &Self) {
        self.calls = self.calls.saturating_add(other.calls);
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.latency_ms += other.latency_ms;
    }

    /// Returns true if no calls were recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.calls == 0
    }
}

/// The answer to a [`Request`].
///
/// Responses can only be built from the request they answer, so the
/// correlation id always equals the request's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(flatten)]
    header: MessageHeader,
    run_id: Uuid,
    success: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    recoverable: bool,
    elapsed_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<ResourceUsage>,
}

impl Response {
    /// The fixed message type of responses.
    pub const MESSAGE_TYPE: MessageType = MessageType::Response;

    fn for_request(request: &Request, success: bool, elapsed_ms: f64) -> Self {
        Self {
            header: MessageHeader::correlated(request.message_id())
                .with_source(request.target())
                .with_target(request.source()),
            run_id: request.run_id(),
            success,
            cancelled: false,
            payload: None,
            error: None,
            error_code: None,
            recoverable: false,
            elapsed_ms,
            usage: None,
        }
    }

    /// Creates a successful response carrying `payload`.
    #[must_use]
    pub fn success(request: &Request, payload: serde_json::Value, elapsed_ms: f64) -> Self {
        Self {
            payload: Some(payload),
            ..Self::for_request(request, true, elapsed_ms)
        }
    }

    /// Creates a failed response.
    #[must_use]
    pub fn failure(
        request: &Request,
        error: impl Into<String>,
        code: ErrorCode,
        recoverable: bool,
        elapsed_ms: f64,
    ) -> Self {
        Self {
            error: Some(error.into()),
            error_code: Some(code),
            recoverable,
            ..Self::for_request(request, false, elapsed_ms)
        }
    }

    /// Creates a cancelled response. Cancellation is not an error.
    #[must_use]
    pub fn cancelled(request: &Request, reason: impl Into<String>, elapsed_ms: f64) -> Self {
        Self {
            cancelled: true,
            error: Some(reason.into()),
            error_code: Some(ErrorCode::PipelineCancelled),
            ..Self::for_request(request, false, elapsed_ms)
        }
    }

    /// Attaches resource usage accounting.
    #[must_use]
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        if !usage.is_empty() {
            self.usage = Some(usage);
        }
        self
    }

    /// Returns the message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        Self::MESSAGE_TYPE
    }

    /// Returns the identity of this response.
    #[must_use]
    pub const fn message_id(&self) -> Uuid {
        self.header.message_id
    }

    /// Returns the identity of the request this response answers.
    #[must_use]
    pub const fn correlation_id(&self) -> Uuid {
        self.header.correlation_id
    }

    /// Returns the envelope header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Returns the run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.success
    }

    /// Returns true if the stage observed cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns the output payload.
    #[must_use]
    pub const fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    /// Consumes the response, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Option<serde_json::Value> {
        self.payload
    }

    /// Returns the error text.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns the error code.
    #[must_use]
    pub const fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    /// Returns true if the failure was classified as transient.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub const fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    /// Returns the resource usage, if any calls were made.
    #[must_use]
    pub const fn usage(&self) -> Option<&ResourceUsage> {
        self.usage.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Request {
        Request::builder(Uuid::new_v4(), "generate")
            .source("coordinator")
            .build()
            .unwrap()
    }

    #[test]
    fn test_success_correlates_to_request() {
        let req = request();
        let resp = Response::success(&req, json!({"paths": 3}), 12.5);

        assert!(resp.is_success());
        assert_eq!(resp.correlation_id(), req.message_id());
        assert_ne!(resp.message_id(), req.message_id());
        assert_eq!(resp.run_id(), req.run_id());
        assert_eq!(resp.header().source, "generate");
        assert_eq!(resp.header().target, "coordinator");
        assert_eq!(resp.payload(), Some(&json!({"paths": 3})));
    }

    #[test]
    fn test_failure_response() {
        let req = request();
        let resp = Response::failure(&req, "boom", ErrorCode::StageProcessingFailed, false, 1.0);

        assert!(!resp.is_success());
        assert!(!resp.is_cancelled());
        assert_eq!(resp.error(), Some("boom"));
        assert_eq!(resp.error_code(), Some(ErrorCode::StageProcessingFailed));
        assert_eq!(resp.correlation_id(), req.message_id());
    }

    #[test]
    fn test_cancelled_response() {
        let req = request();
        let resp = Response::cancelled(&req, "user request", 0.0);
        assert!(resp.is_cancelled());
        assert!(!resp.is_success());
        assert!(!resp.is_recoverable());
    }

    #[test]
    fn test_usage_merge() {
        let mut usage = ResourceUsage::default();
        assert!(usage.is_empty());
        usage.merge(&ResourceUsage::single(100, 20.0));
        usage.merge(&ResourceUsage::single(50, 5.0));
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.tokens, 150);
        assert!((usage.latency_ms - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_usage_is_not_attached() {
        let req = request();
        let resp = Response::success(&req, json!(null), 0.0).with_usage(ResourceUsage::default());
        assert!(resp.usage().is_none());
    }
}
