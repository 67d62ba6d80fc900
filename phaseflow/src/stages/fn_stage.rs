//! Closure-backed stages.

use super::{Stage, StageError};
use crate::context::ExecutionContext;
use async_trait::async_trait;
use std::fmt::Debug;

/// A stage whose processing is a plain function over JSON.
pub struct FnStage<F>
where
    F: Fn(serde_json::Value, &ExecutionContext) -> Result<serde_json::Value, StageError>
        + Send
        + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(serde_json::Value, &ExecutionContext) -> Result<serde_json::Value, StageError>
        + Send
        + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(serde_json::Value, &ExecutionContext) -> Result<serde_json::Value, StageError>
        + Send
        + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(serde_json::Value, &ExecutionContext) -> Result<serde_json::Value, StageError>
        + Send
        + Sync,
{
    type Input = serde_json::Value;
    type Output = serde_json::Value;

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        input: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, StageError> {
        (self.func)(input, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageScope;
    use crate::messages::Request;
    use crate::stages::{StageExecutor, StageRunner};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("render", |input, ctx| {
            let parsed = ctx.checkpoint("parse").cloned().unwrap_or_default();
            Ok(json!({"input": input, "parsed": parsed}))
        });
        assert_eq!(stage.name(), "render");

        let request = Request::builder(Uuid::new_v4(), "render")
            .payload(json!("doc"))
            .context([("parse".to_string(), json!(4))].into())
            .build()
            .unwrap();
        let runner = StageExecutor::new(stage);
        let response = runner.run(request, StageScope::detached()).await;

        assert!(response.is_success());
        assert_eq!(response.payload(), Some(&json!({"input": "doc", "parsed": 4})));
    }

    #[tokio::test]
    async fn test_fn_stage_error() {
        let runner = StageExecutor::new(FnStage::new("render", |_, _| {
            Err(StageError::processing("no layout"))
        }));
        let request = Request::builder(Uuid::new_v4(), "render").build().unwrap();

        let response = runner.run(request, StageScope::detached()).await;

        assert_eq!(response.error(), Some("Processing failed: no layout"));
    }
}
