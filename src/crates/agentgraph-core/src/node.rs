//! The node contract: functions, outputs, errors, and the ambient context.
//!
//! A node function receives a read-only snapshot of the state (a deep copy;
//! mutating it affects nothing) plus a [`NodeContext`] carrying ambient
//! execution context, and returns either a state update, a [`Command`], or
//! nothing. Errors are surfaced through [`NodeError`]; the
//! [`NodeError::Interrupt`] variant is the cooperative-suspension sentinel
//! recognized by the executor, normally produced via
//! [`crate::interrupt::interrupt`] rather than constructed by hand.

use crate::command::Command;
use crate::event::{EventEmitter, ExecutionEvent, NodeMetadata};
use crate::options::CallOptions;
use crate::state::State;
use agentgraph_checkpoint::CheckpointSaver;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// What a node produced.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// A state update mapping, merged through the schema's reducers.
    Update(State),
    /// A structured command (update and/or dynamic routing).
    Command(Command),
    /// No write. Downstream channels do not advance; this is how
    /// router-only nodes work.
    Empty,
}

/// Error returned by a node function.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// Cooperative suspension request carrying the interrupt key and the
    /// value to surface to the caller.
    #[error("interrupt requested for key '{key}'")]
    Interrupt { key: String, value: Value },

    /// The task observed cancellation and unwound.
    #[error("task cancelled")]
    Cancelled,

    /// Ordinary node failure, subject to the node's retry policy.
    #[error("{0}")]
    Failed(String),
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        NodeError::Failed(message.into())
    }

    /// Whether a retry policy may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Failed(_))
    }
}

/// Cooperative cancellation token observed by tasks.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Issuing half of a cancellation pair, held by the executor.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a linked cancellation pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Sender gone: the run finished; treat as never-cancelled.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that is never cancelled, for contexts built outside a run.
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(false);
        // The sender is dropped; borrow keeps returning false.
        Self { rx }
    }
}

/// Resume values visible to one task, with one-shot consumption tracking.
#[derive(Clone, Debug, Default)]
pub struct ResumeView {
    map: Arc<HashMap<String, Value>>,
    used_prior: Arc<HashSet<String>>,
    used_now: Arc<Mutex<HashSet<String>>>,
}

impl ResumeView {
    pub fn new(map: HashMap<String, Value>, used_prior: HashSet<String>) -> Self {
        Self {
            map: Arc::new(map),
            used_prior: Arc::new(used_prior),
            used_now: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Consume the resume value for `key`, if present and not already
    /// consumed in an earlier run of this lineage.
    pub fn take(&self, key: &str) -> Option<Value> {
        if self.used_prior.contains(key) {
            return None;
        }
        let value = self.map.get(key)?.clone();
        self.used_now
            .lock()
            .expect("resume view lock poisoned")
            .insert(key.to_string());
        Some(value)
    }

    /// The full resume map, for forwarding into subgraphs.
    pub fn map(&self) -> &HashMap<String, Value> {
        &self.map
    }

    /// Keys consumed during this run.
    pub fn consumed(&self) -> HashSet<String> {
        self.used_now
            .lock()
            .expect("resume view lock poisoned")
            .clone()
    }
}

/// Ambient execution context shared by every task of a run.
///
/// This is the executor-facing side of the reserved `__exec_context__`
/// entry: it references the run (lineage, saver, event channel) without
/// living inside the state map, which breaks the state→executor ownership
/// cycle at the serialization boundary.
#[derive(Clone)]
pub struct ExecContext {
    pub invocation_id: String,
    pub session: Option<String>,
    pub lineage_id: Option<String>,
    pub namespace: String,
    pub saver: Option<Arc<dyn CheckpointSaver>>,
    pub call_options: CallOptions,
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("invocation_id", &self.invocation_id)
            .field("session", &self.session)
            .field("lineage_id", &self.lineage_id)
            .field("namespace", &self.namespace)
            .field("saver", &self.saver.as_ref().map(|_| "<saver>"))
            .finish()
    }
}

/// Per-task context handed to a node function.
#[derive(Clone, Debug)]
pub struct NodeContext {
    pub node_id: String,
    pub task_id: String,
    pub step: i64,
    pub attempt: u32,
    pub resume: ResumeView,
    /// Resolved call-options view for this node.
    pub options: Value,
    pub cancel: CancelToken,
    pub exec: ExecContext,
    emitter: Option<EventEmitter>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: String,
        task_id: String,
        step: i64,
        attempt: u32,
        resume: ResumeView,
        options: Value,
        cancel: CancelToken,
        exec: ExecContext,
        emitter: Option<EventEmitter>,
    ) -> Self {
        Self {
            node_id,
            task_id,
            step,
            attempt,
            resume,
            options,
            cancel,
            exec,
            emitter,
        }
    }

    /// Emit a `graph.node.custom` event with an arbitrary payload.
    pub fn emit_custom(&self, payload: Value) {
        if let Some(emitter) = &self.emitter {
            let meta = NodeMetadata {
                node_id: &self.node_id,
                task_id: &self.task_id,
                step: self.step,
                attempt: self.attempt,
            };
            emitter.emit(ExecutionEvent::node_custom(
                emitter.invocation_id(),
                &meta,
                &payload,
            ));
        }
    }

    pub(crate) fn emitter(&self) -> Option<&EventEmitter> {
        self.emitter.as_ref()
    }
}

/// An executable unit of work: the only thing the core knows about LLM,
/// tool, or plain function nodes.
#[async_trait]
pub trait NodeFunction: Send + Sync {
    async fn run(&self, snapshot: State, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

type BoxedNodeFuture = Pin<Box<dyn Future<Output = Result<NodeOutput, NodeError>> + Send>>;

/// Adapter letting plain closures act as node functions.
pub struct FnNode<F>(F);

#[async_trait]
impl<F> NodeFunction for FnNode<F>
where
    F: Fn(State, NodeContext) -> BoxedNodeFuture + Send + Sync,
{
    async fn run(&self, snapshot: State, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        (self.0)(snapshot, ctx).await
    }
}

/// Wrap an async closure as a [`NodeFunction`].
///
/// ```rust
/// use agentgraph_core::node::{node_fn, NodeOutput};
/// use serde_json::json;
/// use std::collections::HashMap;
///
/// let node = node_fn(|state, _ctx| async move {
///     let input = state.get("user_input").cloned().unwrap_or(json!(""));
///     Ok(NodeOutput::Update(HashMap::from([
///         ("last_response".to_string(), input),
///     ])))
/// });
/// # let _ = node;
/// ```
pub fn node_fn<F, Fut>(f: F) -> Arc<dyn NodeFunction>
where
    F: Fn(State, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput, NodeError>> + Send + 'static,
{
    Arc::new(FnNode(move |state, ctx| {
        Box::pin(f(state, ctx)) as BoxedNodeFuture
    }))
}
