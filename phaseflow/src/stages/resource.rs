//! Resource-consuming clients a stage calls through its context.

use super::StageError;
use crate::context::ExecutionContext;
use crate::messages::ResourceUsage;
use async_trait::async_trait;

/// The answer of a resource call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReply {
    /// What the resource returned.
    pub payload: serde_json::Value,
    /// What the call cost.
    pub usage: ResourceUsage,
}

impl ResourceReply {
    /// Creates a reply.
    #[must_use]
    pub const fn new(payload: serde_json::Value, usage: ResourceUsage) -> Self {
        Self { payload, usage }
    }
}

/// An external resource such as a language-model client.
///
/// Implementations live outside this crate; stages reach them through
/// [`ExecutionContext::call_resource`] so cancellation is honored and usage
/// is accounted.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Issues one call.
    async fn call(&self, request: serde_json::Value) -> Result<ResourceReply, StageError>;
}

impl ExecutionContext {
    /// Calls `client` through [`ExecutionContext::guarded_call`].
    pub async fn call_resource(
        &self,
        client: &dyn ResourceClient,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, StageError> {
        tracing::trace!(resource = client.name(), stage = self.stage_name(), "Calling resource");
        self.guarded_call(|| async move {
            let reply = client.call(request).await?;
            Ok((reply.payload, reply.usage))
        })
        .await
    }
}
