//! Lifecycle events emitted on the execution stream.
//!
//! The executor emits typed events on a single channel: node lifecycle,
//! pregel phases, channel and state updates, checkpoint lifecycle, and the
//! terminal completion event. Each event names its object type (e.g.
//! `graph.node.start`) and carries a JSON-encoded metadata record under a
//! stable delta key (e.g. `_node_metadata`).
//!
//! Ordering guarantees:
//!
//! - per node: start → custom* → (complete | error);
//! - across nodes within one step, start/complete may interleave; the
//!   step's `graph.state.update` is emitted after every complete;
//! - `graph.checkpoint.created` precedes `graph.checkpoint.committed` for
//!   the same checkpoint id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Event object type tags.
pub mod object {
    pub const EXECUTION: &str = "graph.execution";
    pub const BARRIER: &str = "graph.barrier";
    pub const NODE_START: &str = "graph.node.start";
    pub const NODE_COMPLETE: &str = "graph.node.complete";
    pub const NODE_ERROR: &str = "graph.node.error";
    pub const NODE_CUSTOM: &str = "graph.node.custom";
    pub const NODE_EXECUTION: &str = "graph.node.execution";
    pub const PREGEL_STEP: &str = "graph.pregel.step";
    pub const PREGEL_PLANNING: &str = "graph.pregel.planning";
    pub const PREGEL_EXECUTION: &str = "graph.pregel.execution";
    pub const PREGEL_UPDATE: &str = "graph.pregel.update";
    pub const CHANNEL_UPDATE: &str = "graph.channel.update";
    pub const STATE_UPDATE: &str = "graph.state.update";
    pub const CHECKPOINT_CREATED: &str = "graph.checkpoint.created";
    pub const CHECKPOINT_COMMITTED: &str = "graph.checkpoint.committed";
    pub const CHECKPOINT_INTERRUPT: &str = "graph.checkpoint.interrupt";
}

/// Stable delta keys under which metadata records are carried.
pub mod delta {
    pub const NODE: &str = "_node_metadata";
    pub const NODE_CUSTOM: &str = "_node_custom_metadata";
    pub const PREGEL: &str = "_pregel_metadata";
    pub const CHANNEL: &str = "_channel_metadata";
    pub const STATE: &str = "_state_metadata";
    pub const COMPLETION: &str = "_completion_metadata";
    pub const CHECKPOINT: &str = "_checkpoint_metadata";
}

/// Error info attached to error-typed events.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventError {
    pub kind: String,
    pub message: String,
}

/// One event on the execution stream.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    pub id: String,
    pub object: String,
    pub invocation_id: String,
    /// Scope label for events forwarded out of a subgraph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub ts: DateTime<Utc>,
    /// Delta key → JSON-encoded metadata record.
    pub delta: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    pub done: bool,
}

#[derive(Debug, Serialize)]
pub struct NodeMetadata<'a> {
    pub node_id: &'a str,
    pub task_id: &'a str,
    pub step: i64,
    pub attempt: u32,
}

#[derive(Debug, Serialize)]
pub struct PregelMetadata<'a> {
    pub step: i64,
    pub phase: &'a str,
    pub nodes: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct ChannelMetadata<'a> {
    pub channel: &'a str,
    pub version: u64,
    pub behavior: &'a str,
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct StateMetadata<'a> {
    pub step: i64,
    pub updated_keys: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct CheckpointEventMetadata<'a> {
    pub checkpoint_id: &'a str,
    pub lineage_id: &'a str,
    pub namespace: &'a str,
    pub source: &'a str,
    pub step: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
pub struct CompletionMetadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_state: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
    pub done: bool,
}

impl ExecutionEvent {
    fn new(object: &str, invocation_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            object: object.to_string(),
            invocation_id: invocation_id.to_string(),
            scope: None,
            ts: Utc::now(),
            delta: HashMap::new(),
            error: None,
            done: false,
        }
    }

    fn with_metadata<T: Serialize>(mut self, key: &str, metadata: &T) -> Self {
        // Metadata records are JSON-encoded strings under their delta key;
        // a record that fails to serialize is dropped, not fatal.
        match serde_json::to_string(metadata) {
            Ok(encoded) => {
                self.delta.insert(key.to_string(), encoded);
            }
            Err(e) => {
                tracing::warn!(error = %e, object = %self.object, "failed to encode event metadata");
            }
        }
        self
    }

    pub fn with_error(mut self, kind: &str, message: impl Into<String>) -> Self {
        self.error = Some(EventError {
            kind: kind.to_string(),
            message: message.into(),
        });
        self
    }

    /// Decode the metadata record stored under `key`.
    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.delta
            .get(key)
            .and_then(|encoded| serde_json::from_str(encoded).ok())
    }

    pub fn node_start(invocation_id: &str, meta: &NodeMetadata<'_>) -> Self {
        Self::new(object::NODE_START, invocation_id).with_metadata(delta::NODE, meta)
    }

    pub fn node_complete(invocation_id: &str, meta: &NodeMetadata<'_>) -> Self {
        Self::new(object::NODE_COMPLETE, invocation_id).with_metadata(delta::NODE, meta)
    }

    pub fn node_error(
        invocation_id: &str,
        meta: &NodeMetadata<'_>,
        kind: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(object::NODE_ERROR, invocation_id)
            .with_metadata(delta::NODE, meta)
            .with_error(kind, message)
    }

    /// Progress marker within one task (e.g. a retry attempt).
    pub fn node_execution(invocation_id: &str, meta: &NodeMetadata<'_>) -> Self {
        Self::new(object::NODE_EXECUTION, invocation_id).with_metadata(delta::NODE, meta)
    }

    pub fn node_custom(invocation_id: &str, meta: &NodeMetadata<'_>, payload: &Value) -> Self {
        Self::new(object::NODE_CUSTOM, invocation_id)
            .with_metadata(delta::NODE, meta)
            .with_metadata(delta::NODE_CUSTOM, payload)
    }

    pub fn pregel(invocation_id: &str, object: &str, meta: &PregelMetadata<'_>) -> Self {
        Self::new(object, invocation_id).with_metadata(delta::PREGEL, meta)
    }

    pub fn channel_update(invocation_id: &str, meta: &ChannelMetadata<'_>) -> Self {
        Self::new(object::CHANNEL_UPDATE, invocation_id).with_metadata(delta::CHANNEL, meta)
    }

    pub fn barrier(invocation_id: &str, meta: &ChannelMetadata<'_>) -> Self {
        Self::new(object::BARRIER, invocation_id).with_metadata(delta::CHANNEL, meta)
    }

    pub fn state_update(invocation_id: &str, meta: &StateMetadata<'_>) -> Self {
        Self::new(object::STATE_UPDATE, invocation_id).with_metadata(delta::STATE, meta)
    }

    pub fn checkpoint(
        invocation_id: &str,
        object: &str,
        meta: &CheckpointEventMetadata<'_>,
    ) -> Self {
        Self::new(object, invocation_id).with_metadata(delta::CHECKPOINT, meta)
    }

    pub fn completion(invocation_id: &str, meta: &CompletionMetadata<'_>) -> Self {
        let mut event =
            Self::new(object::EXECUTION, invocation_id).with_metadata(delta::COMPLETION, meta);
        event.done = meta.done;
        if let Some(message) = meta.error {
            event.error = Some(EventError {
                kind: "execution".to_string(),
                message: message.to_string(),
            });
        }
        event
    }
}

/// Receiving half of an execution's event channel. Closes on termination.
pub type EventStream = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Cloneable emitter handed to the loop and into node contexts.
///
/// Sends are best-effort: a dropped receiver silently discards events
/// rather than failing the run.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
    invocation_id: String,
    scope: Option<String>,
}

impl EventEmitter {
    pub fn channel(invocation_id: impl Into<String>) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                invocation_id: invocation_id.into(),
                scope: None,
            },
            rx,
        )
    }

    /// A derived emitter that labels everything it sends with `scope`.
    pub fn scoped(&self, scope: impl Into<String>) -> Self {
        Self {
            tx: self.tx.clone(),
            invocation_id: self.invocation_id.clone(),
            scope: Some(scope.into()),
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn emit(&self, mut event: ExecutionEvent) {
        if event.scope.is_none() {
            event.scope = self.scope.clone();
        }
        let _ = self.tx.send(event);
    }
}
