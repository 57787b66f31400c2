//! Cooperative suspension and the resume protocol.
//!
//! Two interrupt families share one record type:
//!
//! - **Dynamic** interrupts are raised from inside a node via [`interrupt`].
//!   The call either returns the resume value supplied for its key, or
//!   short-circuits the task with a sentinel error the executor turns into
//!   an interrupt checkpoint and a clean termination.
//! - **Static** interrupts are raised by the executor itself at configured
//!   before/after breakpoints; no user code is involved.
//!
//! The recorded [`InterruptState`] is everything resume needs: which node
//! suspended, the key under which a resume value should be delivered, the
//! surfaced value, and the node set that should run after resume. When a
//! subgraph suspends, the parent wraps the child's record in a
//! [`SubgraphInterrupt`] so resume can be forwarded down the stack with
//! the original key intact.

use crate::node::{NodeContext, NodeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which phase produced an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptPhase {
    /// Executor-raised, before the planned nodes ran.
    Before,
    /// Executor-raised, after the completed nodes ran.
    After,
    /// Raised from inside a node function.
    Dynamic,
}

/// Snapshot of a suspension, persisted with the interrupt checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptState {
    /// Node that suspended (for static interrupts, the first affected node
    /// in lexicographic order).
    pub node_id: String,
    /// Task that was executing, when dynamic.
    pub task_id: String,
    /// Key under which a resume value satisfies this interrupt.
    pub key: String,
    /// Value surfaced to the caller.
    pub value: Value,
    /// Nodes that should run after resume (the planned set for a before
    /// interrupt, the completed set for an after interrupt).
    pub next_nodes: Vec<String>,
    pub phase: InterruptPhase,
}

impl InterruptState {
    pub fn dynamic(
        node_id: impl Into<String>,
        task_id: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        next_nodes: Vec<String>,
    ) -> Self {
        let key = key.into();
        Self {
            node_id: node_id.into(),
            task_id: task_id.into(),
            key,
            value,
            next_nodes,
            phase: InterruptPhase::Dynamic,
        }
    }

    pub fn static_breakpoint(phase: InterruptPhase, nodes: Vec<String>) -> Self {
        let node_id = nodes.first().cloned().unwrap_or_default();
        Self {
            node_id: node_id.clone(),
            task_id: String::new(),
            key: node_id,
            value: Value::Array(nodes.iter().cloned().map(Value::String).collect()),
            next_nodes: nodes,
            phase,
        }
    }
}

/// Record wrapping a child graph's interrupt when it bubbles to the parent.
///
/// The `key` is the child's interrupt key, preserved unchanged so one
/// resume call can satisfy the whole stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphInterrupt {
    pub parent_node_id: String,
    pub child_lineage_id: String,
    pub child_namespace: String,
    pub child_checkpoint_id: Option<String>,
    pub child_task_id: String,
    pub key: String,
    pub value: Value,
}

/// Request a cooperative suspension from inside a node function.
///
/// On first execution this returns `Err(NodeError::Interrupt)`, which the
/// node propagates with `?`; the executor snapshots the run and terminates
/// cleanly. When the task is replayed under a resume map containing `key`,
/// the call returns the provided value instead and the node proceeds.
///
/// ```rust
/// use agentgraph_core::interrupt::interrupt;
/// use agentgraph_core::node::{node_fn, NodeOutput};
/// use serde_json::json;
/// use std::collections::HashMap;
///
/// let ask = node_fn(|_state, ctx| async move {
///     let answer = interrupt(&ctx, "approval", json!("please confirm"))?;
///     Ok(NodeOutput::Update(HashMap::from([
///         ("answer".to_string(), answer),
///     ])))
/// });
/// # let _ = ask;
/// ```
pub fn interrupt(
    ctx: &NodeContext,
    key: impl Into<String>,
    value: impl Into<Value>,
) -> Result<Value, NodeError> {
    let key = key.into();
    match ctx.resume.take(&key) {
        Some(resumed) => Ok(resumed),
        None => Err(NodeError::Interrupt {
            key,
            value: value.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{cancel_pair, CancelToken, ExecContext, NodeContext, ResumeView};
    use crate::options::CallOptions;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};

    fn ctx_with_resume(map: HashMap<String, Value>, used: HashSet<String>) -> NodeContext {
        let (_handle, _token) = cancel_pair();
        NodeContext::new(
            "ask".into(),
            "task-1".into(),
            0,
            1,
            ResumeView::new(map, used),
            Value::Null,
            CancelToken::detached(),
            ExecContext {
                invocation_id: "inv-1".into(),
                session: None,
                lineage_id: None,
                namespace: String::new(),
                saver: None,
                call_options: CallOptions::default(),
            },
            None,
        )
    }

    #[test]
    fn first_call_raises_sentinel() {
        let ctx = ctx_with_resume(HashMap::new(), HashSet::new());
        let err = interrupt(&ctx, "approval", json!("confirm?")).unwrap_err();
        match err {
            NodeError::Interrupt { key, value } => {
                assert_eq!(key, "approval");
                assert_eq!(value, json!("confirm?"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn resumed_call_returns_mapped_value() {
        let ctx = ctx_with_resume(
            HashMap::from([("approval".to_string(), json!("yes"))]),
            HashSet::new(),
        );
        assert_eq!(
            interrupt(&ctx, "approval", json!("confirm?")).unwrap(),
            json!("yes")
        );
    }

    #[test]
    fn consumed_key_interrupts_again() {
        let ctx = ctx_with_resume(
            HashMap::from([("approval".to_string(), json!("yes"))]),
            HashSet::from(["approval".to_string()]),
        );
        assert!(interrupt(&ctx, "approval", json!("confirm?")).is_err());
    }

    #[test]
    fn static_breakpoint_records_node_set() {
        let state = InterruptState::static_breakpoint(
            InterruptPhase::Before,
            vec!["a".to_string(), "b".to_string()],
        );
        assert_eq!(state.node_id, "a");
        assert_eq!(state.next_nodes, vec!["a", "b"]);
        assert_eq!(state.phase, InterruptPhase::Before);
        assert_eq!(state.value, json!(["a", "b"]));
    }

    #[test]
    fn interrupt_state_serde_round_trip() {
        let state = InterruptState::dynamic("ask", "task-1", "approval", json!("v"), vec![]);
        let json = serde_json::to_string(&state).unwrap();
        let restored: InterruptState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.key, "approval");
        assert_eq!(restored.phase, InterruptPhase::Dynamic);
    }
}
