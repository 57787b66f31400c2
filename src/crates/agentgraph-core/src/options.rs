//! Per-run, per-node configuration overlay.
//!
//! A [`CallOptions`] overlay travels with an invocation and is resolved at
//! task dispatch: a node sees `merge(global, per_node[node])`. Entries may
//! name nodes inside subgraphs with `/`-separated paths
//! (`"researcher/draft"`); when execution descends into a subgraph the
//! overlay is cloned and re-rooted so the child only sees the slice that
//! names it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Per-invocation configuration patches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOptions {
    /// Patch applied to every node.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub global: Value,

    /// Node id (or `/`-separated node path) → patch.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_node: HashMap<String, Value>,
}

fn shallow_merge(base: &Value, patch: &Value) -> Value {
    match (base.as_object(), patch.as_object()) {
        (Some(base), Some(patch)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Some(_)) | (_, None) if !patch.is_null() => patch.clone(),
        _ => base.clone(),
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, global: Value) -> Self {
        self.global = global;
        self
    }

    pub fn with_node(mut self, node: impl Into<String>, patch: Value) -> Self {
        self.per_node.insert(node.into(), patch);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_null() && self.per_node.is_empty()
    }

    /// The merged view a node sees at dispatch.
    pub fn resolve(&self, node_id: &str) -> Value {
        match self.per_node.get(node_id) {
            Some(patch) => shallow_merge(&self.global, patch),
            None => self.global.clone(),
        }
    }

    /// The overlay a subgraph rooted at `node_id` inherits.
    ///
    /// The child's global view is the parent's resolved view of the
    /// subgraph node; path entries under `node_id/` are re-rooted by
    /// stripping the prefix.
    pub fn scope_to(&self, node_id: &str) -> CallOptions {
        let prefix = format!("{}/", node_id);
        let per_node = self
            .per_node
            .iter()
            .filter_map(|(path, patch)| {
                path.strip_prefix(&prefix)
                    .map(|rest| (rest.to_string(), patch.clone()))
            })
            .collect();

        CallOptions {
            global: self.resolve(node_id),
            per_node,
        }
    }
}
