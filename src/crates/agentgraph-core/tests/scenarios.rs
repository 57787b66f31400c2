//! End-to-end scenarios: linear runs, fan-out, joins, interrupts, resume,
//! and nested subgraphs.

use agentgraph_checkpoint::InMemorySaver;
use agentgraph_core::event::{delta, object, ExecutionEvent};
use agentgraph_core::graph::{condition, multi_condition, GraphBuilder, END, START};
use agentgraph_core::interrupt::interrupt;
use agentgraph_core::node::{node_fn, NodeError, NodeOutput};
use agentgraph_core::pregel::{Executor, Invocation, RunControl};
use agentgraph_core::state::{FieldSpec, ReducerKind, State, StateSchema};
use agentgraph_core::{Command, RetryPolicy, SubgraphNode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn drain(mut events: agentgraph_core::EventStream) -> Vec<ExecutionEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}

fn completion(events: &[ExecutionEvent]) -> Value {
    events
        .iter()
        .rev()
        .find(|e| e.object == object::EXECUTION)
        .and_then(|e| e.metadata(delta::COMPLETION))
        .expect("run emitted a completion event")
}

fn interrupt_record(events: &[ExecutionEvent]) -> Value {
    // Subgraph events are forwarded with a scope label; the run's own
    // interrupt record is the unscoped one.
    events
        .iter()
        .find(|e| e.object == object::CHECKPOINT_INTERRUPT && e.scope.is_none())
        .and_then(|e| e.metadata(delta::CHECKPOINT))
        .and_then(|meta| meta.get("interrupt").cloned())
        .expect("run emitted an interrupt checkpoint event")
}

fn io_schema() -> StateSchema {
    StateSchema::new()
        .field("user_input", FieldSpec::new(ReducerKind::LastValue))
        .field("last_response", FieldSpec::new(ReducerKind::LastValue))
}

fn update(entries: &[(&str, Value)]) -> NodeOutput {
    NodeOutput::Update(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

#[tokio::test]
async fn linear_run_threads_state_through_both_nodes() {
    let graph = GraphBuilder::new(io_schema())
        .add_node(
            "a",
            node_fn(|state, _ctx| async move {
                let input = state["user_input"].as_str().unwrap_or("").to_string();
                Ok(update(&[("last_response", json!(format!("A:{input}")))]))
            }),
        )
        .add_node(
            "b",
            node_fn(|state, _ctx| async move {
                let previous = state["last_response"].as_str().unwrap_or("").to_string();
                Ok(update(&[("last_response", json!(format!("{previous};B")))]))
            }),
        )
        .add_edge(START, "a")
        .add_edge("a", "b")
        .add_edge("b", END)
        .compile()
        .unwrap();

    let events = drain(
        Executor::new(graph)
            .execute(
                State::from([("user_input".to_string(), json!("hi"))]),
                Invocation::new(),
            )
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&events);
    assert_eq!(done["done"], json!(true));
    assert_eq!(done["final_state"]["user_input"], json!("hi"));
    assert_eq!(done["final_state"]["last_response"], json!("A:hi;B"));
}

#[tokio::test]
async fn conditional_fan_out_runs_both_branches_in_one_step() {
    let schema = StateSchema::new()
        .field("a", FieldSpec::new(ReducerKind::LastValue))
        .field("b", FieldSpec::new(ReducerKind::LastValue));

    let graph = GraphBuilder::new(schema)
        .add_node("router", node_fn(|_s, _c| async move { Ok(NodeOutput::Empty) }))
        .add_node("a", node_fn(|_s, _c| async move { Ok(update(&[("a", json!(1))])) }))
        .add_node("b", node_fn(|_s, _c| async move { Ok(update(&[("b", json!(2))])) }))
        .add_edge(START, "router")
        .add_conditional_edges(
            "router",
            multi_condition(|_state| vec!["toA".to_string(), "toB".to_string()]),
            HashMap::from([
                ("toA".to_string(), "a".to_string()),
                ("toB".to_string(), "b".to_string()),
            ]),
        )
        .compile()
        .unwrap();

    let events = drain(
        Executor::new(graph)
            .execute(State::new(), Invocation::new())
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&events);
    assert_eq!(done["final_state"]["a"], json!(1));
    assert_eq!(done["final_state"]["b"], json!(2));

    // Both starts carry the same step.
    let start_steps: Vec<i64> = events
        .iter()
        .filter(|e| e.object == object::NODE_START)
        .filter_map(|e| e.metadata(delta::NODE))
        .filter(|m| m["node_id"] == json!("a") || m["node_id"] == json!("b"))
        .filter_map(|m| m["step"].as_i64())
        .collect();
    assert_eq!(start_steps.len(), 2);
    assert_eq!(start_steps[0], start_steps[1]);

    // One state update for that step, emitted after both completes.
    let complete_indices: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.object == object::NODE_COMPLETE)
        .filter(|(_, e)| {
            e.metadata(delta::NODE)
                .is_some_and(|m| m["node_id"] == json!("a") || m["node_id"] == json!("b"))
        })
        .map(|(i, _)| i)
        .collect();
    let state_update_index = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.object == object::STATE_UPDATE)
        .find(|(_, e)| {
            e.metadata(delta::STATE)
                .is_some_and(|m| m["updated_keys"] == json!(["a", "b"]))
        })
        .map(|(i, _)| i)
        .expect("state update for the fan-out step");
    for index in complete_indices {
        assert!(index < state_update_index);
    }
}

#[tokio::test]
async fn join_barrier_defers_target_until_all_contributors_land() {
    let schema = StateSchema::new()
        .field("done", FieldSpec::new(ReducerKind::MergeMap))
        .field("joined", FieldSpec::new(ReducerKind::LastValue));

    let graph = GraphBuilder::new(schema)
        .add_node("split", node_fn(|_s, _c| async move { Ok(NodeOutput::Empty) }))
        .add_node(
            "a",
            node_fn(|_s, _c| async move { Ok(update(&[("done", json!({"a": true}))])) }),
        )
        .add_node(
            "b",
            node_fn(|_s, _c| async move {
                // Let `a` finish well before `b`.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(update(&[("done", json!({"b": true}))]))
            }),
        )
        .add_node(
            "c",
            node_fn(|state, _c| async move {
                let done = state["done"].clone();
                Ok(update(&[("joined", done)]))
            }),
        )
        .add_edge(START, "split")
        .add_edge("split", "a")
        .add_edge("split", "b")
        .add_join_edge(["a", "b"], "c")
        .add_edge("c", END)
        .compile()
        .unwrap();

    let events = drain(
        Executor::new(graph)
            .execute(State::new(), Invocation::new())
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&events);
    assert_eq!(done["final_state"]["joined"], json!({"a": true, "b": true}));

    // `c` starts only after both contributors completed.
    let index_of = |object_tag: &str, node: &str| {
        events
            .iter()
            .position(|e| {
                e.object == object_tag
                    && e.metadata(delta::NODE)
                        .is_some_and(|m| m["node_id"] == json!(node))
            })
            .unwrap_or_else(|| panic!("missing {object_tag} for {node}"))
    };
    assert!(index_of(object::NODE_COMPLETE, "a") < index_of(object::NODE_START, "c"));
    assert!(index_of(object::NODE_COMPLETE, "b") < index_of(object::NODE_START, "c"));

    // The barrier fill is visible on the stream.
    assert!(events.iter().any(|e| e.object == object::BARRIER));

    // `c` ran exactly once.
    let c_starts = events
        .iter()
        .filter(|e| {
            e.object == object::NODE_START
                && e.metadata(delta::NODE)
                    .is_some_and(|m| m["node_id"] == json!("c"))
        })
        .count();
    assert_eq!(c_starts, 1);
}

fn approval_graph() -> agentgraph_core::CompiledGraph {
    let schema = StateSchema::new().field("answer", FieldSpec::new(ReducerKind::LastValue));
    GraphBuilder::new(schema)
        .add_node(
            "ask",
            node_fn(|_state, ctx| async move {
                let answer = interrupt(&ctx, "approval", json!("please confirm"))?;
                Ok(update(&[("answer", answer)]))
            }),
        )
        .add_edge(START, "ask")
        .add_edge("ask", END)
        .compile()
        .unwrap()
}

#[tokio::test]
async fn dynamic_interrupt_then_resume_delivers_value() {
    let saver = Arc::new(InMemorySaver::new());
    let executor = Executor::new(approval_graph()).with_saver(saver.clone());

    let first = drain(
        executor
            .execute(State::new(), Invocation::new().with_lineage("run-approval"))
            .await
            .unwrap(),
    )
    .await;

    let record = interrupt_record(&first);
    assert_eq!(record["node_id"], json!("ask"));
    assert_eq!(record["key"], json!("approval"));
    assert_eq!(record["value"], json!("please confirm"));
    assert_eq!(completion(&first)["done"], json!(false));

    let second = drain(
        executor
            .resume(
                State::new(),
                Invocation::new().with_lineage("run-approval"),
                None,
                Command::new().with_resume(HashMap::from([(
                    "approval".to_string(),
                    json!("yes"),
                )])),
            )
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&second);
    assert_eq!(done["done"], json!(true));
    assert_eq!(done["final_state"]["answer"], json!("yes"));

    // No reserved keys leak into the serialized final state.
    let leaked: Vec<&String> = done["final_state"]
        .as_object()
        .unwrap()
        .keys()
        .filter(|k| k.starts_with("__"))
        .collect();
    assert!(leaked.is_empty(), "reserved keys leaked: {leaked:?}");
}

#[tokio::test]
async fn single_resume_value_satisfies_the_pending_interrupt() {
    let saver = Arc::new(InMemorySaver::new());
    let executor = Executor::new(approval_graph()).with_saver(saver.clone());

    drain(
        executor
            .execute(State::new(), Invocation::new().with_lineage("run-single"))
            .await
            .unwrap(),
    )
    .await;

    // A bare resume value maps onto the pending interrupt's key.
    let second = drain(
        executor
            .resume(
                State::new(),
                Invocation::new().with_lineage("run-single"),
                None,
                Command::new().with_resume(json!("approved")),
            )
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(
        completion(&second)["final_state"]["answer"],
        json!("approved")
    );
}

#[tokio::test]
async fn interrupt_preserves_sibling_writes_as_pending() {
    // `ask` interrupts while its sibling `note` completes in the same
    // step; the sibling's update must survive into the resumed run.
    let schema = StateSchema::new()
        .field("answer", FieldSpec::new(ReducerKind::LastValue))
        .field("note", FieldSpec::new(ReducerKind::LastValue));

    let graph = GraphBuilder::new(schema)
        .add_node("fan", node_fn(|_s, _c| async move { Ok(NodeOutput::Empty) }))
        .add_node(
            "ask",
            node_fn(|_state, ctx| async move {
                let answer = interrupt(&ctx, "approval", json!("confirm?"))?;
                Ok(update(&[("answer", answer)]))
            }),
        )
        .add_node(
            "note",
            node_fn(|_s, _c| async move { Ok(update(&[("note", json!("recorded"))])) }),
        )
        .add_edge(START, "fan")
        .add_edge("fan", "ask")
        .add_edge("fan", "note")
        .compile()
        .unwrap();

    let saver = Arc::new(InMemorySaver::new());
    let executor = Executor::new(graph).with_saver(saver.clone());

    drain(
        executor
            .execute(State::new(), Invocation::new().with_lineage("run-siblings"))
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&drain(
        executor
            .resume(
                State::new(),
                Invocation::new().with_lineage("run-siblings"),
                None,
                Command::new()
                    .with_resume(HashMap::from([("approval".to_string(), json!("go"))])),
            )
            .await
            .unwrap(),
    )
    .await);

    assert_eq!(done["final_state"]["answer"], json!("go"));
    assert_eq!(done["final_state"]["note"], json!("recorded"));
}

#[tokio::test]
async fn nested_subgraph_interrupt_resumes_through_the_parent() {
    // Child graph: ask for approval, answer into last_response.
    let child = GraphBuilder::new(io_schema())
        .add_node(
            "ask",
            node_fn(|_state, ctx| async move {
                let answer = interrupt(&ctx, "approval", json!("child needs approval"))?;
                Ok(update(&[("last_response", answer)]))
            }),
        )
        .add_edge(START, "ask")
        .add_edge("ask", END)
        .compile()
        .unwrap();

    let parent = GraphBuilder::new(io_schema())
        .add_node_kind(
            "child",
            agentgraph_core::NodeKind::Agent,
            Arc::new(SubgraphNode::new(child)),
        )
        .add_edge(START, "child")
        .add_edge("child", END)
        .compile()
        .unwrap();

    let saver = Arc::new(InMemorySaver::new());
    let executor = Executor::new(parent).with_saver(saver.clone());

    let first = drain(
        executor
            .execute(
                State::from([("user_input".to_string(), json!("start"))]),
                Invocation::new().with_lineage("run-nested"),
            )
            .await
            .unwrap(),
    )
    .await;

    // The parent's interrupt record preserves the child's key unchanged
    // and wraps the child coordinates.
    let record = interrupt_record(&first);
    assert_eq!(record["key"], json!("approval"));
    assert_eq!(record["value"]["parent_node_id"], json!("child"));
    assert_eq!(record["value"]["child_namespace"], json!("child"));
    assert_eq!(record["value"]["key"], json!("approval"));
    assert_eq!(completion(&first)["done"], json!(false));

    // One resume call on the parent completes both levels.
    let second = drain(
        executor
            .resume(
                State::new(),
                Invocation::new().with_lineage("run-nested"),
                None,
                Command::new()
                    .with_resume(HashMap::from([("approval".to_string(), json!("ok"))])),
            )
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&second);
    assert_eq!(done["done"], json!(true));
    assert_eq!(done["final_state"]["last_response"], json!("ok"));
}

#[tokio::test]
async fn static_before_interrupt_then_plain_resume() {
    let schema = StateSchema::new().field("ran", FieldSpec::new(ReducerKind::LastValue));
    let graph = GraphBuilder::new(schema)
        .add_node(
            "a",
            node_fn(|_s, _c| async move { Ok(update(&[("ran", json!(true))])) }),
        )
        .add_edge(START, "a")
        .add_edge("a", END)
        .set_interrupt_before("a")
        .compile()
        .unwrap();

    let saver = Arc::new(InMemorySaver::new());
    let executor = Executor::new(graph).with_saver(saver.clone());

    let first = drain(
        executor
            .execute(State::new(), Invocation::new().with_lineage("run-before"))
            .await
            .unwrap(),
    )
    .await;

    let record = interrupt_record(&first);
    assert_eq!(record["phase"], json!("before"));
    assert_eq!(record["next_nodes"], json!(["a"]));
    assert_eq!(completion(&first)["done"], json!(false));

    // No resume value needed: the recorded marker lets the plan proceed.
    let second = drain(
        executor
            .resume(
                State::new(),
                Invocation::new().with_lineage("run-before"),
                None,
                Command::new(),
            )
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&second);
    assert_eq!(done["done"], json!(true));
    assert_eq!(done["final_state"]["ran"], json!(true));
}

#[tokio::test]
async fn static_after_interrupt_records_completed_set() {
    let schema = StateSchema::new().field("ran", FieldSpec::new(ReducerKind::LastValue));
    let graph = GraphBuilder::new(schema)
        .add_node(
            "a",
            node_fn(|_s, _c| async move { Ok(update(&[("ran", json!(true))])) }),
        )
        .add_node("b", node_fn(|_s, _c| async move { Ok(NodeOutput::Empty) }))
        .add_edge(START, "a")
        .add_edge("a", "b")
        .add_edge("b", END)
        .set_interrupt_after("a")
        .compile()
        .unwrap();

    let saver = Arc::new(InMemorySaver::new());
    let executor = Executor::new(graph).with_saver(saver.clone());

    let first = drain(
        executor
            .execute(State::new(), Invocation::new().with_lineage("run-after"))
            .await
            .unwrap(),
    )
    .await;

    let record = interrupt_record(&first);
    assert_eq!(record["phase"], json!("after"));
    assert_eq!(record["next_nodes"], json!(["a"]));
    // The write landed before the suspension.
    assert_eq!(completion(&first)["final_state"]["ran"], json!(true));

    let second = drain(
        executor
            .resume(
                State::new(),
                Invocation::new().with_lineage("run-after"),
                None,
                Command::new(),
            )
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(completion(&second)["done"], json!(true));
}

#[tokio::test]
async fn retries_exhaust_then_surface_as_fatal_node_error() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();

    let graph = GraphBuilder::new(StateSchema::new())
        .add_node(
            "flaky",
            node_fn(move |_s, _c| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<NodeOutput, _>(NodeError::failed("upstream unavailable"))
                }
            }),
        )
        .add_edge(START, "flaky")
        .add_edge("flaky", END)
        .set_retry(
            "flaky",
            RetryPolicy::new(3)
                .with_initial_interval(0.001)
                .with_jitter(false),
        )
        .compile()
        .unwrap();

    let events = drain(
        Executor::new(graph)
            .execute(State::new(), Invocation::new())
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let node_error = events
        .iter()
        .find(|e| e.object == object::NODE_ERROR)
        .expect("node error event");
    assert_eq!(
        node_error.metadata(delta::NODE).unwrap()["attempt"],
        json!(3)
    );

    let done = completion(&events);
    assert_eq!(done["done"], json!(true));
    assert!(done["error"]
        .as_str()
        .unwrap()
        .contains("failed after 3 attempt(s)"));
}

#[tokio::test]
async fn failed_node_with_supervising_conditional_routes_onward() {
    let schema = StateSchema::new().field("handled", FieldSpec::new(ReducerKind::LastValue));
    let graph = GraphBuilder::new(schema)
        .add_node(
            "work",
            node_fn(|_s, _c| async move {
                Err::<NodeOutput, _>(NodeError::failed("boom"))
            }),
        )
        .add_node(
            "recover",
            node_fn(|_s, _c| async move { Ok(update(&[("handled", json!(true))])) }),
        )
        .add_edge(START, "work")
        .add_conditional_edges(
            "work",
            condition(|_state| "recover".to_string()),
            HashMap::new(),
        )
        .add_edge("recover", END)
        .compile()
        .unwrap();

    let events = drain(
        Executor::new(graph)
            .execute(State::new(), Invocation::new())
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&events);
    assert_eq!(done["done"], json!(true));
    assert!(done["error"].is_null());
    assert_eq!(done["final_state"]["handled"], json!(true));
    // The failure itself is still visible as a node error event.
    assert!(events.iter().any(|e| e.object == object::NODE_ERROR));
}

#[tokio::test]
async fn unmapped_conditional_key_fails_after_the_step() {
    let graph = GraphBuilder::new(StateSchema::new())
        .add_node("router", node_fn(|_s, _c| async move { Ok(NodeOutput::Empty) }))
        .add_edge(START, "router")
        .add_conditional_edges(
            "router",
            condition(|_state| "nowhere".to_string()),
            HashMap::new(),
        )
        .compile()
        .unwrap();

    let events = drain(
        Executor::new(graph)
            .execute(State::new(), Invocation::new())
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&events);
    assert_eq!(done["done"], json!(true));
    assert!(done["error"].as_str().unwrap().contains("nowhere"));
}

#[tokio::test]
async fn channel_versions_never_decrease_on_the_stream() {
    let graph = GraphBuilder::new(io_schema())
        .add_node(
            "a",
            node_fn(|_s, _c| async move { Ok(update(&[("last_response", json!("a"))])) }),
        )
        .add_node(
            "b",
            node_fn(|_s, _c| async move { Ok(update(&[("last_response", json!("b"))])) }),
        )
        .add_edge(START, "a")
        .add_edge("a", "b")
        .add_edge("b", END)
        .compile()
        .unwrap();

    let events = drain(
        Executor::new(graph)
            .execute(State::new(), Invocation::new())
            .await
            .unwrap(),
    )
    .await;

    let mut high_water: HashMap<String, u64> = HashMap::new();
    for event in &events {
        if event.object != object::CHANNEL_UPDATE {
            continue;
        }
        let Some(meta) = event.metadata(delta::CHANNEL) else {
            continue;
        };
        let channel = meta["channel"].as_str().unwrap().to_string();
        let version = meta["version"].as_u64().unwrap();
        if let Some(previous) = high_water.get(&channel) {
            assert!(version >= *previous, "channel {channel} version decreased");
        }
        high_water.insert(channel, version);
    }
}

#[tokio::test]
async fn external_cancellation_surfaces_as_cancelled() {
    let control = RunControl::new();
    let graph = GraphBuilder::new(StateSchema::new())
        .add_node(
            "slow",
            node_fn(|_s, ctx| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(NodeOutput::Empty),
                    _ = ctx.cancel.cancelled() => Err(NodeError::Cancelled),
                }
            }),
        )
        .add_edge(START, "slow")
        .add_edge("slow", END)
        .compile()
        .unwrap();

    let executor = Executor::new(graph);
    let stream = executor
        .execute(
            State::new(),
            Invocation::new().with_control(control.clone()),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    control.cancel();

    let events = drain(stream).await;
    let done = completion(&events);
    assert!(done["error"].as_str().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn goto_command_routes_dynamically() {
    let schema = StateSchema::new().field("trail", FieldSpec::new(ReducerKind::AppendMessages));
    let graph = GraphBuilder::new(schema)
        .add_node(
            "decide",
            node_fn(|_s, _c| async move {
                Ok(NodeOutput::Command(
                    Command::new()
                        .with_update(State::from([("trail".to_string(), json!(["decide"]))]))
                        .with_goto("finish"),
                ))
            }),
        )
        .add_node(
            "finish",
            node_fn(|_s, _c| async move {
                Ok(NodeOutput::Command(
                    Command::new()
                        .with_update(State::from([("trail".to_string(), json!(["finish"]))]))
                        .with_goto(END),
                ))
            }),
        )
        .add_edge(START, "decide")
        .compile()
        .unwrap();

    let events = drain(
        Executor::new(graph)
            .execute(State::new(), Invocation::new())
            .await
            .unwrap(),
    )
    .await;

    let done = completion(&events);
    assert_eq!(done["final_state"]["trail"], json!(["decide", "finish"]));
}
