//! Error types for graph construction and execution.
//!
//! The taxonomy distinguishes *kinds* of failure rather than mirroring
//! internal types:
//!
//! - [`GraphError::Validation`] - compile-time structure errors; never
//!   raised during a run.
//! - [`GraphError::UserNode`] - a node function failed after its retry
//!   policy was exhausted. The step still completes; the run then ends
//!   fatally unless a conditional on the failed node routes onward.
//! - [`GraphError::Planning`] - a conditional returned a key with no
//!   resolution in its path map or the source node's ends map. Fatal.
//! - [`GraphError::Channel`] - barrier overflow and other channel contract
//!   violations. (A write to an unknown channel is a non-fatal diagnostic,
//!   not this error.)
//! - [`GraphError::InterruptSignal`] - not a failure: the control-flow
//!   sentinel that short-circuits a step, persists an interrupt checkpoint
//!   and terminates the run cleanly.
//! - [`GraphError::Cancelled`] - cooperative cancellation from the caller
//!   or an external interrupt deadline.
//! - [`GraphError::Checkpoint`] - saver failures; reported, non-fatal by
//!   default.

use crate::interrupt::InterruptState;
use thiserror::Error;

/// Convenience result type using [`GraphError`].
pub type Result<T> = std::result::Result<T, GraphError>;

/// Error type covering graph compilation and execution.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure validation failed at compile time.
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// A node function returned an error and its retry policy is exhausted.
    #[error("Node '{node}' failed after {attempts} attempt(s): {message}")]
    UserNode {
        node: String,
        attempts: u32,
        message: String,
    },

    /// A conditional edge produced a branch key with no mapping.
    #[error("Conditional on '{node}' returned unmapped branch key '{key}'")]
    Planning { node: String, key: String },

    /// A channel contract was violated (e.g. barrier overflow).
    #[error("Channel error: {0}")]
    Channel(String),

    /// The run suspended on an interrupt. Control flow, not a failure.
    #[error("Execution interrupted at node '{}' (key '{}')", .0.node_id, .0.key)]
    InterruptSignal(Box<InterruptState>),

    /// Execution was cancelled cooperatively.
    #[error("Execution cancelled")]
    Cancelled,

    /// Checkpoint saver failure. Non-fatal unless configured otherwise.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] agentgraph_checkpoint::CheckpointError),

    /// JSON serialization failure at a state/event boundary.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// State schema violation (missing required field, bad update shape).
    #[error("State error: {0}")]
    State(String),

    /// Execution error without a more specific kind.
    #[error("Execution failed: {0}")]
    Execution(String),
}

impl GraphError {
    /// Node-failure constructor used once retries are exhausted.
    pub fn user_node(
        node: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::UserNode {
            node: node.into(),
            attempts,
            message: message.into(),
        }
    }

    pub fn planning(node: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Planning {
            node: node.into(),
            key: key.into(),
        }
    }

    /// Whether this error terminates the event stream.
    ///
    /// Interrupts are clean terminations and checkpoint failures are
    /// reported without aborting the run by default.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            GraphError::InterruptSignal(_) | GraphError::Checkpoint(_)
        )
    }

    /// Short kind tag used in error-typed events.
    pub fn kind(&self) -> &'static str {
        match self {
            GraphError::Validation(_) => "validation",
            GraphError::UserNode { .. } => "user_node",
            GraphError::Planning { .. } => "planning",
            GraphError::Channel(_) => "channel",
            GraphError::InterruptSignal(_) => "interrupt",
            GraphError::Cancelled => "cancelled",
            GraphError::Checkpoint(_) => "checkpoint",
            GraphError::Serialization(_) => "serialization",
            GraphError::State(_) => "state",
            GraphError::Execution(_) => "execution",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_node_error_formats_attempts() {
        let err = GraphError::user_node("llm", 3, "timeout");
        assert_eq!(
            err.to_string(),
            "Node 'llm' failed after 3 attempt(s): timeout"
        );
        assert_eq!(err.kind(), "user_node");
        assert!(err.is_fatal());
    }

    #[test]
    fn checkpoint_errors_are_not_fatal() {
        let err = GraphError::Checkpoint(
            agentgraph_checkpoint::CheckpointError::Storage("down".into()),
        );
        assert!(!err.is_fatal());
        assert_eq!(err.kind(), "checkpoint");
    }
}
