//! # agentgraph-core - Pregel-style agent workflow execution
//!
//! A superstep execution engine for graph-structured agent workflows: a
//! typed shared state advances through user-defined nodes wired by static
//! edges, conditional edges and dynamic routing commands, with durable
//! checkpointing, human-in-the-loop interrupts and resumable execution.
//!
//! ## Model
//!
//! - **State** ([`state`]) - a string-keyed map with per-field reducers;
//!   multi-writer merges are deterministic, associative and idempotent
//!   under replay.
//! - **Channels** ([`agentgraph_checkpoint::Channel`]) - named, versioned
//!   cells (last-value, barrier, topic) the scheduler triggers over.
//! - **Compiled graph** ([`graph`]) - immutable node/edge/trigger/writer
//!   wiring produced by [`graph::GraphBuilder::compile`].
//! - **Executor** ([`pregel`]) - the superstep loop: plan → execute in
//!   parallel → apply writes → advance versions → decide the next step,
//!   emitting typed lifecycle events ([`event`]).
//! - **Checkpoints** ([`manager`], [`agentgraph_checkpoint`]) - snapshots
//!   at step boundaries; a run resumes from the latest interrupted
//!   checkpoint of its `(lineage, namespace)` flow.
//! - **Interrupts** ([`interrupt`]) - cooperative suspension from inside a
//!   node or at configured breakpoints; resume values are delivered by
//!   key, across subgraph levels.
//! - **Subgraphs** ([`subgraph`]) - nodes running nested compiled graphs
//!   that forward events and participate in the checkpoint lineage.
//!
//! ## A two-node run
//!
//! ```rust
//! use agentgraph_core::graph::{GraphBuilder, START, END};
//! use agentgraph_core::node::{node_fn, NodeOutput};
//! use agentgraph_core::pregel::{Executor, Invocation};
//! use agentgraph_core::state::{FieldSpec, ReducerKind, StateSchema};
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = StateSchema::new()
//!     .field("user_input", FieldSpec::new(ReducerKind::LastValue))
//!     .field("last_response", FieldSpec::new(ReducerKind::LastValue));
//!
//! let graph = GraphBuilder::new(schema)
//!     .add_node("respond", node_fn(|state, _ctx| async move {
//!         let input = state["user_input"].as_str().unwrap_or("").to_string();
//!         Ok(NodeOutput::Update(HashMap::from([
//!             ("last_response".to_string(), json!(format!("echo: {input}"))),
//!         ])))
//!     }))
//!     .add_edge(START, "respond")
//!     .add_edge("respond", END)
//!     .compile()?;
//!
//! let executor = Executor::new(graph);
//! let mut events = executor
//!     .execute(
//!         HashMap::from([("user_input".to_string(), json!("hi"))]),
//!         Invocation::new(),
//!     )
//!     .await?;
//!
//! let mut final_state = None;
//! while let Some(event) = events.recv().await {
//!     if event.done {
//!         final_state = event.metadata(agentgraph_core::event::delta::COMPLETION);
//!     }
//! }
//! let final_state = final_state.expect("run completed");
//! assert_eq!(final_state["final_state"]["last_response"], json!("echo: hi"));
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod error;
pub mod event;
pub mod graph;
pub mod interrupt;
pub mod manager;
pub mod node;
pub mod options;
pub mod pregel;
pub mod retry;
pub mod state;
pub mod subgraph;

pub use command::{Command, GotoTarget, ResumeValue};
pub use error::{GraphError, Result};
pub use event::{EventStream, ExecutionEvent};
pub use graph::{CompiledGraph, GraphBuilder, NodeKind, END, START};
pub use interrupt::{interrupt, InterruptPhase, InterruptState, SubgraphInterrupt};
pub use manager::CheckpointManager;
pub use node::{node_fn, NodeContext, NodeError, NodeFunction, NodeOutput};
pub use options::CallOptions;
pub use pregel::{Executor, Invocation, RunControl, RunOptions};
pub use retry::RetryPolicy;
pub use state::{State, StateSchema};
pub use subgraph::SubgraphNode;
