//! Subgraph (agent) nodes: a node whose function runs a nested compiled
//! graph.
//!
//! The child participates in the same checkpoint lineage as the parent but
//! under its own namespace (defaulting to the parent node id, nested under
//! the parent's namespace), so its flow never collides with the parent's.
//! Child events are forwarded to the parent stream, optionally labelled
//! with a scope. When the child suspends on an interrupt, the parent task
//! raises an interrupt of its own carrying a [`SubgraphInterrupt`] record -
//! with the child's resume key preserved - so one resume call on the
//! parent satisfies the whole stack.

use crate::command::Command;
use crate::event::{delta, object, ExecutionEvent};
use crate::interrupt::{InterruptState, SubgraphInterrupt};
use crate::node::{NodeContext, NodeError, NodeFunction, NodeOutput};
use crate::pregel::{Executor, Invocation, RunControl};
use crate::state::{strip_reserved, State};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps parent state to the child's initial state.
pub type InputMapper = Arc<dyn Fn(&State) -> State + Send + Sync>;

/// Maps `(parent_state, child_final_state)` to a parent state update.
pub type OutputMapper = Arc<dyn Fn(&State, &Value) -> State + Send + Sync>;

const USER_INPUT_KEY: &str = "user_input";
const LAST_RESPONSE_KEY: &str = "last_response";

/// A node that runs a nested compiled graph.
pub struct SubgraphNode {
    graph: Arc<crate::graph::CompiledGraph>,
    input_mapper: Option<InputMapper>,
    output_mapper: Option<OutputMapper>,
    input_from_last_response: bool,
    namespace: Option<String>,
    scope_label: Option<String>,
}

impl SubgraphNode {
    pub fn new(graph: crate::graph::CompiledGraph) -> Self {
        Self::from_arc(Arc::new(graph))
    }

    pub fn from_arc(graph: Arc<crate::graph::CompiledGraph>) -> Self {
        Self {
            graph,
            input_mapper: None,
            output_mapper: None,
            input_from_last_response: false,
            namespace: None,
            scope_label: None,
        }
    }

    pub fn with_input_mapper(mut self, mapper: InputMapper) -> Self {
        self.input_mapper = Some(mapper);
        self
    }

    pub fn with_output_mapper(mut self, mapper: OutputMapper) -> Self {
        self.output_mapper = Some(mapper);
        self
    }

    /// Seed the child's user-input key from the parent's last response,
    /// falling back to the parent's user input.
    pub fn with_input_from_last_response(mut self) -> Self {
        self.input_from_last_response = true;
        self
    }

    /// Override the child's checkpoint namespace (default: parent node id).
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Label forwarded child events with a scope.
    pub fn with_scope_label(mut self, label: impl Into<String>) -> Self {
        self.scope_label = Some(label.into());
        self
    }

    fn child_state(&self, parent: &State) -> State {
        let mut child = match &self.input_mapper {
            Some(mapper) => mapper(parent),
            None => strip_reserved(parent),
        };
        if self.input_from_last_response {
            let seed = parent
                .get(LAST_RESPONSE_KEY)
                .or_else(|| parent.get(USER_INPUT_KEY))
                .cloned();
            if let Some(seed) = seed {
                child.insert(USER_INPUT_KEY.to_string(), seed);
            }
        }
        child
    }

    fn parent_update(&self, parent: &State, child_final: &Value) -> State {
        match &self.output_mapper {
            Some(mapper) => mapper(parent, child_final),
            None => {
                // Default: forward the child's last response.
                let mut update = State::new();
                if let Some(response) = child_final.get(LAST_RESPONSE_KEY) {
                    update.insert(LAST_RESPONSE_KEY.to_string(), response.clone());
                }
                update
            }
        }
    }

    fn child_namespace(&self, ctx: &NodeContext) -> String {
        let own = self.namespace.clone().unwrap_or_else(|| ctx.node_id.clone());
        if ctx.exec.namespace.is_empty() {
            own
        } else {
            format!("{}/{}", ctx.exec.namespace, own)
        }
    }
}

/// What the forwarded child stream settled to.
struct ChildRun {
    final_state: Option<Value>,
    error: Option<String>,
    interrupt: Option<(Option<String>, InterruptState)>,
}

#[async_trait]
impl NodeFunction for SubgraphNode {
    async fn run(&self, snapshot: State, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let namespace = self.child_namespace(&ctx);
        let lineage = ctx.exec.lineage_id.clone();

        let mut executor = Executor::from_arc(self.graph.clone());
        if let Some(saver) = &ctx.exec.saver {
            executor = executor.with_saver(saver.clone());
        }

        let control = RunControl::new();
        let mut invocation = Invocation::new()
            .with_invocation_id(format!("{}:{}", ctx.exec.invocation_id, ctx.node_id))
            .with_call_options(ctx.exec.call_options.scope_to(&ctx.node_id))
            .with_control(control.clone());
        if let Some(session) = &ctx.exec.session {
            invocation = invocation.with_session(session.clone());
        }
        if let Some(lineage) = &lineage {
            invocation = invocation
                .with_lineage(lineage.clone())
                .with_namespace(namespace.clone());
        }

        // Resume the child when it left an interrupted checkpoint behind
        // and this task carries resume values; otherwise start it fresh.
        let resume_map = ctx.resume.map().clone();
        let child_interrupted = match (&ctx.exec.saver, &lineage) {
            (Some(saver), Some(_)) if !resume_map.is_empty() => saver
                .latest_interrupted(&invocation.run_options.checkpoint)
                .await
                .map_err(|e| NodeError::failed(e.to_string()))?
                .is_some(),
            _ => false,
        };

        let mut events = if child_interrupted {
            executor
                .resume(
                    State::new(),
                    invocation,
                    None,
                    Command::new().with_resume(resume_map),
                )
                .await
                .map_err(|e| NodeError::failed(e.to_string()))?
        } else {
            executor
                .execute(self.child_state(&snapshot), invocation)
                .await
                .map_err(|e| NodeError::failed(e.to_string()))?
        };

        let forward = ctx.emitter().map(|emitter| {
            emitter.scoped(
                self.scope_label
                    .clone()
                    .unwrap_or_else(|| ctx.node_id.clone()),
            )
        });

        let mut run = ChildRun {
            final_state: None,
            error: None,
            interrupt: None,
        };

        loop {
            let event = if ctx.cancel.is_cancelled() {
                // Cancellation has been forwarded; keep draining so the
                // child unwinds cooperatively and the stream closes.
                events.recv().await
            } else {
                tokio::select! {
                    event = events.recv() => event,
                    _ = ctx.cancel.cancelled() => {
                        control.cancel();
                        continue;
                    }
                }
            };
            let Some(event) = event else {
                break;
            };

            capture(&mut run, &event);
            if let Some(forward) = &forward {
                forward.emit(event);
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        if let Some((checkpoint_id, interrupt)) = run.interrupt {
            let record = SubgraphInterrupt {
                parent_node_id: ctx.node_id.clone(),
                child_lineage_id: lineage.unwrap_or_default(),
                child_namespace: namespace,
                child_checkpoint_id: checkpoint_id,
                child_task_id: interrupt.task_id.clone(),
                key: interrupt.key.clone(),
                value: interrupt.value.clone(),
            };
            return Err(NodeError::Interrupt {
                key: record.key.clone(),
                value: json!(record),
            });
        }

        if let Some(message) = run.error {
            return Err(NodeError::failed(message));
        }

        let child_final = run.final_state.unwrap_or(Value::Null);
        Ok(NodeOutput::Update(
            self.parent_update(&snapshot, &child_final),
        ))
    }
}

/// Pull interrupt and completion facts out of a forwarded child event.
fn capture(run: &mut ChildRun, event: &ExecutionEvent) {
    match event.object.as_str() {
        object::CHECKPOINT_INTERRUPT => {
            if let Some(meta) = event.metadata(delta::CHECKPOINT) {
                let checkpoint_id = meta
                    .get("checkpoint_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(String::from);
                if let Some(interrupt) = meta
                    .get("interrupt")
                    .and_then(|v| serde_json::from_value::<InterruptState>(v.clone()).ok())
                {
                    run.interrupt = Some((checkpoint_id, interrupt));
                }
            }
        }
        object::EXECUTION => {
            if let Some(meta) = event.metadata(delta::COMPLETION) {
                if let Some(final_state) = meta.get("final_state") {
                    run.final_state = Some(final_state.clone());
                }
                run.error = meta
                    .get("error")
                    .and_then(Value::as_str)
                    .map(String::from);
            }
        }
        _ => {}
    }
}

/// Convenience: build a subgraph node with explicit key-to-key mappers.
///
/// `input_keys` copies parent fields into the child under new names;
/// `output_keys` copies child result fields back into the parent.
pub fn mapped_subgraph(
    graph: crate::graph::CompiledGraph,
    input_keys: HashMap<String, String>,
    output_keys: HashMap<String, String>,
) -> SubgraphNode {
    let input_mapper: InputMapper = Arc::new(move |parent: &State| {
        input_keys
            .iter()
            .filter_map(|(from, to)| parent.get(from).map(|v| (to.clone(), v.clone())))
            .collect()
    });
    let output_mapper: OutputMapper = Arc::new(move |_parent: &State, child: &Value| {
        output_keys
            .iter()
            .filter_map(|(from, to)| child.get(from).map(|v| (to.clone(), v.clone())))
            .collect()
    });
    SubgraphNode::new(graph)
        .with_input_mapper(input_mapper)
        .with_output_mapper(output_mapper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{CancelToken, ExecContext, ResumeView};
    use crate::options::CallOptions;
    use serde_json::json;

    fn subgraph() -> SubgraphNode {
        let graph = crate::graph::GraphBuilder::new(crate::state::StateSchema::new())
            .add_node(
                "inner",
                crate::node::node_fn(|_s, _c| async move { Ok(NodeOutput::Empty) }),
            )
            .add_edge(crate::graph::START, "inner")
            .add_edge("inner", crate::graph::END)
            .compile()
            .unwrap();
        SubgraphNode::new(graph)
    }

    fn ctx(namespace: &str) -> NodeContext {
        NodeContext::new(
            "child".into(),
            "0:child".into(),
            0,
            1,
            ResumeView::default(),
            Value::Null,
            CancelToken::detached(),
            ExecContext {
                invocation_id: "inv-1".into(),
                session: None,
                lineage_id: Some("run-1".into()),
                namespace: namespace.to_string(),
                saver: None,
                call_options: CallOptions::default(),
            },
            None,
        )
    }

    #[test]
    fn default_input_mapper_strips_reserved_keys() {
        let node = subgraph();
        let parent = State::from([
            ("user_input".to_string(), json!("hi")),
            ("__current_node__".to_string(), json!("child")),
        ]);
        let child = node.child_state(&parent);
        assert_eq!(child.len(), 1);
        assert_eq!(child["user_input"], json!("hi"));
    }

    #[test]
    fn last_response_mode_prefers_last_response() {
        let node = subgraph().with_input_from_last_response();
        let parent = State::from([
            ("user_input".to_string(), json!("original")),
            ("last_response".to_string(), json!("previous answer")),
        ]);
        let child = node.child_state(&parent);
        assert_eq!(child["user_input"], json!("previous answer"));

        let parent = State::from([("user_input".to_string(), json!("original"))]);
        let child = node.child_state(&parent);
        assert_eq!(child["user_input"], json!("original"));
    }

    #[test]
    fn default_output_mapper_forwards_last_response() {
        let node = subgraph();
        let update = node.parent_update(
            &State::new(),
            &json!({"last_response": "from child", "scratch": 1}),
        );
        assert_eq!(update.len(), 1);
        assert_eq!(update["last_response"], json!("from child"));
    }

    #[test]
    fn child_namespace_nests_under_parent() {
        let node = subgraph();
        assert_eq!(node.child_namespace(&ctx("")), "child");
        assert_eq!(node.child_namespace(&ctx("outer")), "outer/child");

        let node = subgraph().with_namespace("custom");
        assert_eq!(node.child_namespace(&ctx("outer")), "outer/custom");
    }

    #[test]
    fn mapped_subgraph_translates_keys() {
        let graph = crate::graph::GraphBuilder::new(crate::state::StateSchema::new())
            .add_node(
                "inner",
                crate::node::node_fn(|_s, _c| async move { Ok(NodeOutput::Empty) }),
            )
            .add_edge(crate::graph::START, "inner")
            .add_edge("inner", crate::graph::END)
            .compile()
            .unwrap();
        let node = mapped_subgraph(
            graph,
            HashMap::from([("question".to_string(), "user_input".to_string())]),
            HashMap::from([("last_response".to_string(), "answer".to_string())]),
        );

        let child = node.child_state(&State::from([("question".to_string(), json!("why?"))]));
        assert_eq!(child["user_input"], json!("why?"));

        let update = node.parent_update(&State::new(), &json!({"last_response": "because"}));
        assert_eq!(update["answer"], json!("because"));
    }
}
