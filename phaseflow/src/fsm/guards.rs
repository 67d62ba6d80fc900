//! Named guard predicates over a run.

use super::PipelineState;
use crate::context::RunContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Input field the start guard looks at unless configured otherwise.
pub const DEFAULT_INPUT_KEY: &str = "hierarchy";

type GuardFn = dyn Fn(&RunContext) -> bool + Send + Sync;

/// A pure, named predicate that must hold for a transition to apply.
#[derive(Clone)]
pub struct Guard {
    name: String,
    check: Arc<GuardFn>,
}

impl Guard {
    /// Creates a guard from a predicate.
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&RunContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Returns the guard name used in rejection reasons.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the guard.
    #[must_use]
    pub fn check(&self, ctx: &RunContext) -> bool {
        (self.check)(ctx)
    }

    /// `has_input`: the input field `key` is present and non-empty.
    #[must_use]
    pub fn has_input(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new("has_input", move |ctx| {
            ctx.field(&key).is_some_and(|value| is_non_empty(&value))
        })
    }

    /// Every named checkpoint is present and non-empty.
    #[must_use]
    pub fn checkpoints_present(name: impl Into<String>, stages: Vec<String>) -> Self {
        Self::new(name, move |ctx| {
            stages
                .iter()
                .all(|stage| ctx.checkpoint(stage).is_some_and(is_non_empty))
        })
    }

    /// Every named checkpoint has been written, whatever its value.
    #[must_use]
    pub fn checkpoints_recorded(name: impl Into<String>, stages: Vec<String>) -> Self {
        Self::new(name, move |ctx| {
            stages.iter().all(|stage| ctx.has_checkpoint(stage))
        })
    }

    /// `can_retry`: the run has retries left.
    #[must_use]
    pub fn can_retry() -> Self {
        Self::new("can_retry", RunContext::can_retry)
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").field("name", &self.name).finish()
    }
}

/// Null, `{}`, `[]` and `""` count as empty.
#[must_use]
pub fn is_non_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::String(text) => !text.is_empty(),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => true,
    }
}

/// Which input and checkpoints the standard guards require.
///
/// Completing phase B requires the checkpoints of both phase A and phase B;
/// the other phases only require their own. Only phase A outputs must be
/// non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRequirements {
    /// Input field that must be non-empty to start.
    #[serde(default = "default_input_key")]
    pub input_key: String,
    /// Checkpoints written while in [`PipelineState::RunningA`].
    #[serde(default)]
    pub phase_a: Vec<String>,
    /// Checkpoints written while in [`PipelineState::RunningB`].
    #[serde(default)]
    pub phase_b: Vec<String>,
    /// Checkpoints written while in [`PipelineState::RunningC`].
    #[serde(default)]
    pub phase_c: Vec<String>,
}

fn default_input_key() -> String {
    DEFAULT_INPUT_KEY.to_string()
}

impl Default for PhaseRequirements {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_KEY)
    }
}

impl PhaseRequirements {
    /// Requirements with no checkpoints, starting on `input_key`.
    #[must_use]
    pub fn new(input_key: impl Into<String>) -> Self {
        Self {
            input_key: input_key.into(),
            phase_a: Vec::new(),
            phase_b: Vec::new(),
            phase_c: Vec::new(),
        }
    }

    /// Builds requirements from `(stage name, state)` pairs.
    pub fn from_stages<'a, I>(input_key: impl Into<String>, stages: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, PipelineState)>,
    {
        stages
            .into_iter()
            .fold(Self::new(input_key), |reqs, (name, state)| {
                reqs.with_stage(state, name)
            })
    }

    /// Adds a checkpoint requirement to the phase run in `state`.
    /// Non-running states are ignored.
    #[must_use]
    pub fn with_stage(mut self, state: PipelineState, stage: impl Into<String>) -> Self {
        if let Some(phase) = self.phase_mut(state) {
            phase.push(stage.into());
        }
        self
    }

    /// Returns the checkpoints written by the phase run in `state`.
    #[must_use]
    pub fn phase(&self, state: PipelineState) -> &[String] {
        match state {
            PipelineState::RunningA => &self.phase_a,
            PipelineState::RunningB => &self.phase_b,
            PipelineState::RunningC => &self.phase_c,
            _ => &[],
        }
    }

    fn phase_mut(&mut self, state: PipelineState) -> Option<&mut Vec<String>> {
        match state {
            PipelineState::RunningA => Some(&mut self.phase_a),
            PipelineState::RunningB => Some(&mut self.phase_b),
            PipelineState::RunningC => Some(&mut self.phase_c),
            _ => None,
        }
    }

    /// `phase_a_output_valid`.
    #[must_use]
    pub fn phase_a_guard(&self) -> Guard {
        Guard::checkpoints_present("phase_a_output_valid", self.phase_a.clone())
    }

    /// `phase_b_checkpoints_present`.
    #[must_use]
    pub fn phase_b_guard(&self) -> Guard {
        let required = self.phase_a.iter().chain(&self.phase_b).cloned().collect();
        Guard::checkpoints_recorded("phase_b_checkpoints_present", required)
    }

    /// `final_checkpoint_present`.
    #[must_use]
    pub fn phase_c_guard(&self) -> Guard {
        Guard::checkpoints_recorded("final_checkpoint_present", self.phase_c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn reqs() -> PhaseRequirements {
        PhaseRequirements::from_stages(
            "hierarchy",
            [
                ("parse", PipelineState::RunningA),
                ("generate", PipelineState::RunningB),
                ("render", PipelineState::RunningC),
            ],
        )
    }

    #[test]
    fn test_has_input() {
        let guard = Guard::has_input("hierarchy");
        assert!(guard.check(&RunContext::new("o", json!({"hierarchy": {"title": "x"}}))));
        assert!(!guard.check(&RunContext::new("o", json!({"hierarchy": {}}))));
        assert!(!guard.check(&RunContext::new("o", json!({"options": {}}))));
        assert!(!guard.check(&RunContext::new("o", json!(null))));
        assert_eq!(guard.name(), "has_input");
    }

    #[test]
    fn test_guards_are_deterministic() {
        let ctx = RunContext::new("o", json!({"hierarchy": [1]}));
        let guard = Guard::has_input("hierarchy");
        let first = guard.check(&ctx);
        assert_eq!(first, guard.check(&ctx));
    }

    #[test]
    fn test_phase_b_requires_both_prior_checkpoints() {
        let guard = reqs().phase_b_guard();
        let mut ctx = RunContext::new("o", json!({"hierarchy": [1]}));

        ctx.write_checkpoint("generate", json!({"paths": 2}));
        assert!(!guard.check(&ctx));

        ctx.write_checkpoint("parse", json!({"nodes": 1}));
        assert!(guard.check(&ctx));
    }

    #[test]
    fn test_only_phase_a_rejects_empty_outputs() {
        let reqs = reqs();
        let mut ctx = RunContext::new("o", json!({"hierarchy": [1]}));
        ctx.write_checkpoint("parse", json!({}));
        ctx.write_checkpoint("generate", json!([]));
        ctx.write_checkpoint("render", json!(null));

        assert!(!reqs.phase_a_guard().check(&ctx));
        assert!(reqs.phase_b_guard().check(&ctx));
        assert!(reqs.phase_c_guard().check(&ctx));

        ctx.write_checkpoint("parse", json!({"nodes": 1}));
        assert!(reqs.phase_a_guard().check(&ctx));
    }

    #[test]
    fn test_from_stages() {
        let reqs = reqs();
        assert_eq!(reqs.phase(PipelineState::RunningA).to_vec(), vec!["parse".to_string()]);
        assert_eq!(reqs.phase(PipelineState::RunningC).to_vec(), vec!["render".to_string()]);
        assert!(reqs.phase(PipelineState::Idle).is_empty());
    }

    #[test]
    fn test_default_requirements_deserialize() {
        let reqs: PhaseRequirements = serde_json::from_str("{}").unwrap();
        assert_eq!(reqs, PhaseRequirements::default());
        assert_eq!(reqs.input_key, DEFAULT_INPUT_KEY);
    }

    #[test]
    fn test_non_empty() {
        assert!(is_non_empty(&json!(0)));
        assert!(is_non_empty(&json!(false)));
        assert!(!is_non_empty(&json!("")));
        assert!(!is_non_empty(&json!([])));
    }
}
