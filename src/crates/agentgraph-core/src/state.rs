//! Typed shared state with per-field reducers.
//!
//! The state is a mapping from string keys to JSON values, partitioned into
//! user-declared fields (governed by a [`StateSchema`]) and reserved keys
//! carrying execution context. Reserved keys are never routed through
//! reducers, never copied into subgraph runtime state, and are stripped from
//! the serialized view carried by the terminal completion event.
//!
//! Reducers merge a field's existing value with an update:
//! `(existing, update) → merged`. Every reducer is deterministic,
//! associative and idempotent under replay, so re-applying the writes
//! recorded in an interrupt checkpoint reproduces the same state.
//!
//! ```rust
//! use agentgraph_core::state::{FieldSpec, ReducerKind, StateSchema};
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! let schema = StateSchema::new()
//!     .field("last_response", FieldSpec::new(ReducerKind::LastValue))
//!     .field("messages", FieldSpec::new(ReducerKind::AppendMessages));
//!
//! let mut state = HashMap::new();
//! let update = HashMap::from([
//!     ("last_response".to_string(), json!("hi")),
//!     ("messages".to_string(), json!([{"id": "m1", "content": "hi"}])),
//! ]);
//! schema.apply_update(&mut state, &update);
//! assert_eq!(state["last_response"], json!("hi"));
//! ```

use crate::error::{GraphError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The shared state: field name → value.
pub type State = HashMap<String, Value>;

/// Reserved state keys carrying execution context.
///
/// Everything prefixed `__` is reserved; these constants name the keys the
/// executor itself reads and writes.
pub mod reserved {
    /// Structured command returned by the previous node, when replayed.
    pub const COMMAND: &str = "__command__";
    /// Resume values keyed by interrupt key, supplied at resume.
    pub const RESUME_MAP: &str = "__resume_map__";
    /// Node set recorded by a static interrupt, consumed on resume.
    pub const NEXT_NODES: &str = "__next_nodes__";
    /// Interrupt keys already satisfied in this lineage.
    pub const USED_INTERRUPTS: &str = "__used_interrupts__";
    /// Execution-context handle. Never serialized.
    pub const EXEC_CONTEXT: &str = "__exec_context__";
    /// Id of the node currently executing.
    pub const CURRENT_NODE: &str = "__current_node__";
    /// Reference to the parent agent, inside a subgraph run.
    pub const PARENT_AGENT: &str = "__parent_agent__";
    /// Session handle. Never serialized.
    pub const SESSION: &str = "__session__";
    /// Callback holders. Never serialized.
    pub const CALLBACKS: &str = "__callbacks__";
    /// One-shot per-node message overrides.
    pub const NODE_MESSAGES: &str = "__node_messages__";
}

/// Whether a key is reserved for execution context.
pub fn is_reserved(key: &str) -> bool {
    key.starts_with("__")
}

/// Copy of `state` without reserved keys, for completion events and
/// subgraph input mapping.
pub fn strip_reserved(state: &State) -> State {
    state
        .iter()
        .filter(|(k, _)| !is_reserved(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A deterministic binary merge function for one state field.
pub trait Reducer: Send + Sync {
    fn apply(&self, existing: Option<&Value>, update: &Value) -> Value;
}

/// Built-in reducer selection for a schema field.
#[derive(Clone)]
pub enum ReducerKind {
    /// Last write wins. The default for scalars.
    LastValue,
    /// Append new messages, deduplicating by `id` (full-value equality when
    /// no id is present).
    AppendMessages,
    /// Shallow map merge. An inner `null` deletes that entry.
    MergeMap,
    /// Per-node-bucketed one-shot message overrides: `node_id → messages`.
    /// An empty list at a key is a tombstone meaning "consumed by that
    /// node" and survives further merges.
    NodeMessages,
    /// User-supplied reducer.
    Custom(Arc<dyn Reducer>),
}

impl fmt::Debug for ReducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReducerKind::LastValue => "LastValue",
            ReducerKind::AppendMessages => "AppendMessages",
            ReducerKind::MergeMap => "MergeMap",
            ReducerKind::NodeMessages => "NodeMessages",
            ReducerKind::Custom(_) => "Custom",
        };
        write!(f, "ReducerKind::{}", name)
    }
}

impl ReducerKind {
    fn apply(&self, existing: Option<&Value>, update: &Value) -> Value {
        match self {
            ReducerKind::LastValue => update.clone(),
            ReducerKind::AppendMessages => append_messages(existing, update),
            ReducerKind::MergeMap => merge_map(existing, update),
            ReducerKind::NodeMessages => merge_node_messages(existing, update),
            ReducerKind::Custom(reducer) => reducer.apply(existing, update),
        }
    }
}

/// Schema entry for one user-declared state field.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub reducer: ReducerKind,
    pub default: Option<Value>,
    pub required: bool,
}

impl FieldSpec {
    pub fn new(reducer: ReducerKind) -> Self {
        Self {
            reducer,
            default: None,
            required: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Per-field merge rules for the user-declared part of the state.
#[derive(Clone, Debug, Default)]
pub struct StateSchema {
    fields: HashMap<String, FieldSpec>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Fill defaults and check required fields on the initial state.
    pub fn initialize(&self, state: &mut State) -> Result<()> {
        let mut names: Vec<&String> = self.fields.keys().collect();
        names.sort();
        for name in names {
            let spec = &self.fields[name];
            if !state.contains_key(name) {
                if let Some(default) = &spec.default {
                    state.insert(name.clone(), default.clone());
                } else if spec.required {
                    return Err(GraphError::State(format!(
                        "required state field '{}' is missing",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply one update map to the state.
    ///
    /// Keys are processed in sorted order. Reserved keys are skipped (the
    /// executor manages them directly); a whole-field `null` clears the
    /// field; otherwise the field's reducer (last-write-wins when
    /// undeclared) merges the update into the existing value.
    pub fn apply_update(&self, state: &mut State, update: &State) {
        let mut keys: Vec<&String> = update.keys().collect();
        keys.sort();

        for key in keys {
            if is_reserved(key) {
                continue;
            }
            let value = &update[key];
            if value.is_null() {
                state.remove(key);
                continue;
            }
            let merged = match self.fields.get(key) {
                Some(spec) => spec.reducer.apply(state.get(key), value),
                None => value.clone(),
            };
            state.insert(key.clone(), merged);
        }
    }

    /// Fold a step's update maps into the state in deterministic order.
    ///
    /// `updates` must already be ordered by `(step, lex(node_id))`; the
    /// executor sorts before calling. Because reducers are associative and
    /// idempotent, repeating the fold yields the same state.
    pub fn merge_updates<'a>(
        &self,
        state: &mut State,
        updates: impl IntoIterator<Item = &'a State>,
    ) {
        for update in updates {
            self.apply_update(state, update);
        }
    }
}

fn message_id(message: &Value) -> Option<&str> {
    message.get("id").and_then(Value::as_str)
}

fn append_messages(existing: Option<&Value>, update: &Value) -> Value {
    let mut merged: Vec<Value> = existing
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let incoming: Vec<Value> = match update {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };

    for message in incoming {
        let duplicate = match message_id(&message) {
            Some(id) => merged
                .iter()
                .any(|m| message_id(m).is_some_and(|seen| seen == id)),
            None => merged.contains(&message),
        };
        if !duplicate {
            merged.push(message);
        }
    }

    Value::Array(merged)
}

fn merge_map(existing: Option<&Value>, update: &Value) -> Value {
    let mut merged: Map<String, Value> = existing
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(patch) = update.as_object() {
        for (key, value) in patch {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Object(merged)
    } else {
        update.clone()
    }
}

fn merge_node_messages(existing: Option<&Value>, update: &Value) -> Value {
    let mut merged: Map<String, Value> = existing
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(buckets) = update.as_object() {
        for (node_id, messages) in buckets {
            // An empty list is a consumption tombstone and always sticks.
            merged.insert(node_id.clone(), messages.clone());
        }
        Value::Object(merged)
    } else {
        update.clone()
    }
}
