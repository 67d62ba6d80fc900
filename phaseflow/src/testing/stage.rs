//! Scripted stage.

use crate::cancellation::CancellationToken;
use crate::context::ExecutionContext;
use crate::stages::{Stage, StageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return the value.
    Succeed(Value),
    /// Fail with a non-recoverable processing error.
    Fail(String),
    /// Fail with a recoverable timeout error.
    TimeOut(String),
    /// Sleep, then return the value.
    Delay(Duration, Value),
    /// Cancel the given token, then return the value.
    CancelRun(Arc<CancellationToken>, Value),
}

/// A stage that replays [`Step`]s in order.
///
/// The last step repeats once the script runs out. Every payload received
/// is recorded.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    payloads: Mutex<Vec<Value>>,
}

impl ScriptedStage {
    /// Creates a stage that plays `steps`.
    pub fn new(name: impl Into<String>, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(steps.into_iter().collect()),
            last: Mutex::new(None),
            payloads: Mutex::new(Vec::new()),
        }
    }

    /// A stage that always returns `output`.
    pub fn succeeding(name: impl Into<String>, output: Value) -> Self {
        Self::new(name, [Step::Succeed(output)])
    }

    /// A stage that always fails with `message`.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, [Step::Fail(message.into())])
    }

    /// Number of times `process` was entered.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.payloads.lock().len()
    }

    /// Payloads received, in call order.
    #[must_use]
    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().clone()
    }

    fn next_step(&self) -> Option<Step> {
        let mut last = self.last.lock();
        if let Some(step) = self.script.lock().pop_front() {
            *last = Some(step);
        }
        last.clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, StageError> {
        self.payloads.lock().push(input);

        match self.next_step() {
            None => Ok(Value::Null),
            Some(Step::Succeed(value)) => Ok(value),
            Some(Step::Fail(message)) => Err(StageError::processing(message)),
            Some(Step::TimeOut(message)) => Err(StageError::timeout(message)),
            Some(Step::Delay(delay, value)) => {
                tokio::time::sleep(delay).await;
                ctx.check_cancelled()?;
                Ok(value)
            }
            Some(Step::CancelRun(token, value)) => {
                token.cancel(format!("cancelled by {}", self.name));
                Ok(value)
            }
        }
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

    fn request(target: &str) -> Request {
        Request::builder(Uuid::new_v4(), target)
            .payload(json!({"n": 1}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_script_plays_in_order_then_repeats() {
        let stage = ScriptedStage::new(
            "parse",
            [Step::Fail("bad".into()), Step::Succeed(json!({"ok": true}))],
        );
        let executor = StageExecutor::new(stage);

        let first = executor.run(request("parse"), StageScope::detached()).await;
        let second = executor.run(request("parse"), StageScope::detached()).await;
        let third = executor.run(request("parse"), StageScope::detached()).await;

        assert!(!first.is_success());
        assert!(second.is_success());
        assert!(third.is_success());
        assert_eq!(executor.stage().call_count(), 3);
        assert_eq!(executor.stage().payloads()[0], json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_timeout_step_is_recoverable() {
        let executor = StageExecutor::new(ScriptedStage::new("parse", [Step::TimeOut("slow".into())]));
        let response = executor.run(request("parse"), StageScope::detached()).await;
        assert!(response.is_recoverable());
    }

    #[tokio::test]
    async fn test_cancel_run_step_cancels_token() {
        let token = CancellationToken::shared();
        let stage = ScriptedStage::new("parse", [Step::CancelRun(token.clone(), json!(1))]);
        let response = StageExecutor::new(stage)
            .run(request("parse"), StageScope::new(token.clone(), crate::events::default_sink()))
            .await;

        assert!(token.is_cancelled());
        assert!(response.is_cancelled());
    }
}
