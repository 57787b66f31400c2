//! Structured node return values for dynamic control flow.
//!
//! A node may return a [`Command`] instead of a plain state update to
//! combine an update with dynamic routing (`goto`) or, during replay, to
//! deliver resume values for pending interrupts. `goto` targets are
//! resolved exactly like conditional-edge branch keys: through the source
//! node's path map or ends map, with the `End` sentinel terminating the
//! run.

use crate::state::State;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Navigation target of a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GotoTarget {
    /// A single branch key.
    Node(String),
    /// Several branch keys, activating their targets in the same step.
    Nodes(Vec<String>),
}

impl From<String> for GotoTarget {
    fn from(node: String) -> Self {
        GotoTarget::Node(node)
    }
}

impl From<&str> for GotoTarget {
    fn from(node: &str) -> Self {
        GotoTarget::Node(node.to_string())
    }
}

impl From<Vec<String>> for GotoTarget {
    fn from(nodes: Vec<String>) -> Self {
        GotoTarget::Nodes(nodes)
    }
}

impl GotoTarget {
    /// The branch keys named by this target.
    pub fn keys(&self) -> Vec<String> {
        match self {
            GotoTarget::Node(node) => vec![node.clone()],
            GotoTarget::Nodes(nodes) => nodes.clone(),
        }
    }
}

/// Resume values supplied when re-entering an interrupted run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResumeValue {
    /// Satisfy the single pending interrupt.
    Single(Value),
    /// Satisfy interrupts by key, possibly across nesting levels.
    Map(HashMap<String, Value>),
}

impl From<Value> for ResumeValue {
    fn from(value: Value) -> Self {
        ResumeValue::Single(value)
    }
}

impl From<HashMap<String, Value>> for ResumeValue {
    fn from(map: HashMap<String, Value>) -> Self {
        ResumeValue::Map(map)
    }
}

/// Structured return value from a node: `{update, goto, resume}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Command {
    /// State update merged through the schema's reducers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<State>,

    /// Dynamic branch, resolved like a conditional edge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goto: Option<GotoTarget>,

    /// Resume values; only meaningful during replay of an interrupted run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeValue>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, update: State) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_goto(mut self, goto: impl Into<GotoTarget>) -> Self {
        self.goto = Some(goto.into());
        self
    }

    pub fn with_resume(mut self, resume: impl Into<ResumeValue>) -> Self {
        self.resume = Some(resume.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_none() && self.goto.is_none() && self.resume.is_none()
    }

    /// The resume values as a keyed map. A `Single` value maps to the
    /// given default key.
    pub fn resume_map(&self, default_key: &str) -> HashMap<String, Value> {
        match &self.resume {
            Some(ResumeValue::Map(map)) => map.clone(),
            Some(ResumeValue::Single(value)) => {
                HashMap::from([(default_key.to_string(), value.clone())])
            }
            None => HashMap::new(),
        }
    }
}
