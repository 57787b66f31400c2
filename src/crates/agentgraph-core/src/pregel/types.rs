//! Task and invocation types for the Pregel executor.

use crate::command::Command;
use crate::node::NodeOutput;
use crate::options::CallOptions;
use crate::state::State;
use agentgraph_checkpoint::{CheckpointConfig, IncludeContents};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// One scheduled execution of a node at a given superstep.
///
/// Created by the planner at step start, destroyed after writes are
/// applied. The input is a deep-copied snapshot; tasks never observe each
/// other's writes within a step.
#[derive(Clone, Debug)]
pub struct Task {
    pub step: i64,
    pub node_id: String,
    pub task_id: String,
    /// Trigger channels subscribed by the node.
    pub triggers: Vec<String>,
    /// Version of each trigger channel at read time. Recorded as the
    /// node's high-water-mark once the task's writes are applied.
    pub observed: HashMap<String, u64>,
    pub input: State,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// The writes one settled task contributes to write application.
///
/// Serializable so the set pending at an interrupt can be recorded in the
/// checkpoint and replayed on resume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskWrites {
    pub node_id: String,
    pub task_id: String,
    pub triggers: Vec<String>,
    pub observed: HashMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<State>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    /// The task settled with an error. Its updates are discarded and its
    /// writers do not fire; only its conditional edges run (a supervising
    /// conditional may route on error) and its high-water-marks advance.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

impl TaskWrites {
    pub fn from_output(task: &Task, output: &NodeOutput) -> Self {
        let (update, command) = match output {
            NodeOutput::Update(update) => (Some(update.clone()), None),
            NodeOutput::Command(command) => (None, Some(command.clone())),
            NodeOutput::Empty => (None, None),
        };
        Self {
            node_id: task.node_id.clone(),
            task_id: task.task_id.clone(),
            triggers: task.triggers.clone(),
            observed: task.observed.clone(),
            update,
            command,
            failed: false,
        }
    }

    /// Bookkeeping-only writes for a task that failed.
    pub fn from_failure(task: &Task) -> Self {
        Self {
            node_id: task.node_id.clone(),
            task_id: task.task_id.clone(),
            triggers: task.triggers.clone(),
            observed: task.observed.clone(),
            update: None,
            command: None,
            failed: true,
        }
    }

    /// The state update this task contributes, if any.
    pub fn state_update(&self) -> Option<&State> {
        self.update
            .as_ref()
            .or_else(|| self.command.as_ref().and_then(|c| c.update.as_ref()))
    }
}

/// How one task settled.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task: Task,
    pub attempts: u32,
    pub result: Result<NodeOutput, crate::node::NodeError>,
    /// Resume keys the task consumed while running.
    pub consumed_resume_keys: Vec<String>,
}

/// Out-of-band control over a running execution.
///
/// An interrupt request waits by default for the current step's tasks to
/// finish, then suspends before the next step; with a timeout, in-flight
/// tasks are cancelled when the deadline elapses.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    interrupt: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    timeout: Arc<Mutex<Option<Duration>>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful interrupt at the next step boundary; with a
    /// timeout, in-flight tasks are cancelled once it elapses.
    pub fn request_interrupt(&self, timeout: Option<Duration>) {
        *self.timeout.lock().expect("run control lock poisoned") = timeout;
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Request cooperative cancellation of the whole run.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn interrupt_timeout(&self) -> Option<Duration> {
        *self.timeout.lock().expect("run control lock poisoned")
    }
}

/// Per-run execution options.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Checkpoint scope: `lineage_id` (required to persist),
    /// `checkpoint_id` (resume target), `checkpoint_ns` (sub-flow
    /// isolation).
    pub checkpoint: CheckpointConfig,
    pub include_contents: IncludeContents,
    pub call_options: CallOptions,
    /// Superstep budget; exceeding it is an execution error.
    pub max_steps: usize,
    /// Cancel sibling tasks as soon as one task in the step fails.
    pub cancel_siblings_on_error: bool,
    /// Treat a checkpoint-saver failure as fatal instead of diagnostic.
    pub fail_on_checkpoint_error: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointConfig::default(),
            include_contents: IncludeContents::default(),
            call_options: CallOptions::default(),
            max_steps: 64,
            cancel_siblings_on_error: false,
            fail_on_checkpoint_error: false,
        }
    }
}

/// Invocation descriptor submitted alongside the initial state.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub invocation_id: String,
    pub session: Option<String>,
    pub request_id: Option<String>,
    /// Event-stream override; `None` follows the executor default.
    pub stream: Option<bool>,
    /// Caller-supplied runtime context merged into reserved state.
    pub runtime_state: State,
    pub run_options: RunOptions,
    pub control: Option<RunControl>,
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}

impl Invocation {
    pub fn new() -> Self {
        Self {
            invocation_id: Uuid::new_v4().to_string(),
            session: None,
            request_id: None,
            stream: None,
            runtime_state: State::new(),
            run_options: RunOptions::default(),
            control: None,
        }
    }

    pub fn with_invocation_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = id.into();
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_lineage(mut self, lineage_id: impl Into<String>) -> Self {
        self.run_options.checkpoint.lineage_id = Some(lineage_id.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.run_options.checkpoint.checkpoint_ns = Some(namespace.into());
        self
    }

    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.run_options.call_options = options;
        self
    }

    pub fn with_run_options(mut self, options: RunOptions) -> Self {
        self.run_options = options;
        self
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = Some(control);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task {
            step: 1,
            node_id: "a".into(),
            task_id: "1:a".into(),
            triggers: vec!["branch:to:a".into()],
            observed: HashMap::from([("branch:to:a".to_string(), 2u64)]),
            input: State::new(),
            attempt: 1,
            max_attempts: 1,
        }
    }

    #[test]
    fn task_writes_capture_update() {
        let writes = TaskWrites::from_output(
            &task(),
            &NodeOutput::Update(State::from([("x".to_string(), json!(1))])),
        );
        assert_eq!(writes.state_update().unwrap()["x"], json!(1));
        assert!(writes.command.is_none());
    }

    #[test]
    fn task_writes_surface_command_update() {
        let command = Command::new()
            .with_update(State::from([("y".to_string(), json!(2))]))
            .with_goto("b");
        let writes = TaskWrites::from_output(&task(), &NodeOutput::Command(command));
        assert_eq!(writes.state_update().unwrap()["y"], json!(2));
    }

    #[test]
    fn task_writes_serde_round_trip() {
        let writes = TaskWrites::from_output(
            &task(),
            &NodeOutput::Command(Command::new().with_goto("b")),
        );
        let encoded = serde_json::to_value(&writes).unwrap();
        let decoded: TaskWrites = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.node_id, "a");
        assert_eq!(decoded.observed["branch:to:a"], 2);
    }

    #[test]
    fn run_control_flags() {
        let control = RunControl::new();
        assert!(!control.interrupt_requested());

        control.request_interrupt(Some(Duration::from_secs(5)));
        assert!(control.interrupt_requested());
        assert_eq!(control.interrupt_timeout(), Some(Duration::from_secs(5)));

        control.cancel();
        assert!(control.cancel_requested());
    }
}
