//! The Pregel executor: superstep scheduling over channels and triggers.
//!
//! [`Executor`] is the public entry point. It owns nothing mutable itself;
//! each call to [`Executor::execute`] or [`Executor::resume`] spins up one
//! [`loop_impl::PregelLoop`] on a background task and hands back the event
//! stream. The loop owns the live state and channel maps for the duration
//! of the run; the stream closes on termination.
//!
//! ```rust,no_run
//! use agentgraph_core::graph::{GraphBuilder, START, END};
//! use agentgraph_core::node::{node_fn, NodeOutput};
//! use agentgraph_core::pregel::{Executor, Invocation};
//! use agentgraph_core::state::StateSchema;
//! use std::collections::HashMap;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = GraphBuilder::new(StateSchema::new())
//!     .add_node("echo", node_fn(|state, _ctx| async move {
//!         Ok(NodeOutput::Update(state))
//!     }))
//!     .add_edge(START, "echo")
//!     .add_edge("echo", END)
//!     .compile()?;
//!
//! let executor = Executor::new(graph);
//! let mut events = executor.execute(HashMap::new(), Invocation::new()).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.object);
//! }
//! # Ok(())
//! # }
//! ```

pub mod algo;
pub(crate) mod loop_impl;
pub mod types;

pub use types::{Invocation, RunControl, RunOptions, Task, TaskOutcome, TaskWrites};

use crate::command::Command;
use crate::error::Result;
use crate::event::{EventEmitter, EventStream};
use crate::graph::CompiledGraph;
use crate::manager::CheckpointManager;
use crate::state::State;
use agentgraph_checkpoint::CheckpointSaver;
use loop_impl::PregelLoop;
use std::sync::Arc;

/// Superstep executor over a compiled graph.
#[derive(Clone)]
pub struct Executor {
    graph: Arc<CompiledGraph>,
    saver: Option<Arc<dyn CheckpointSaver>>,
}

impl Executor {
    pub fn new(graph: CompiledGraph) -> Self {
        Self::from_arc(Arc::new(graph))
    }

    pub fn from_arc(graph: Arc<CompiledGraph>) -> Self {
        Self { graph, saver: None }
    }

    /// Attach a checkpoint saver; persistence still requires a
    /// `lineage_id` on the invocation.
    pub fn with_saver(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.saver = Some(saver);
        self
    }

    pub fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    pub fn saver(&self) -> Option<&Arc<dyn CheckpointSaver>> {
        self.saver.as_ref()
    }

    /// Administrative access to the checkpoint store, if one is attached.
    pub fn checkpoints(&self) -> Option<CheckpointManager> {
        self.saver.clone().map(CheckpointManager::new)
    }

    /// Run the graph from an initial state. Returns the event stream;
    /// the run proceeds on a background task and the stream closes on
    /// termination.
    pub async fn execute(&self, state: State, invocation: Invocation) -> Result<EventStream> {
        let (emitter, stream) = EventEmitter::channel(invocation.invocation_id.clone());
        let pregel_loop = PregelLoop::fresh(
            self.graph.clone(),
            self.saver.clone(),
            state,
            invocation,
            emitter,
        )?;
        tokio::spawn(pregel_loop.run());
        Ok(stream)
    }

    /// Continue from the named checkpoint, or from the latest interrupted
    /// checkpoint under the invocation's `(lineage_id, namespace)` when no
    /// id is given. The command carries resume values and an optional
    /// state update.
    pub async fn resume(
        &self,
        state: State,
        invocation: Invocation,
        checkpoint_id: Option<String>,
        command: Command,
    ) -> Result<EventStream> {
        let (emitter, stream) = EventEmitter::channel(invocation.invocation_id.clone());
        let pregel_loop = PregelLoop::resuming(
            self.graph.clone(),
            self.saver.clone(),
            state,
            invocation,
            checkpoint_id,
            command,
            emitter,
        )
        .await?;
        tokio::spawn(pregel_loop.run());
        Ok(stream)
    }
}
