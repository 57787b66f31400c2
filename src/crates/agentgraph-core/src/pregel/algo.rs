//! Core Pregel algorithm functions: planning and write application.
//!
//! [`plan_step`] decides which nodes run next using version-based
//! triggering: a node is active when at least one subscribed channel is
//! available *and* that channel's version exceeds the node's recorded
//! high-water-mark. [`apply_writes`] is the single-writer barrier at the
//! end of a step: it folds state updates through the schema's reducers,
//! evaluates writer rules and conditional edges, resolves dynamic `goto`
//! commands, records barrier contributions, and bumps channel versions -
//! all in deterministic `(step, lex(node_id))` order.

use crate::error::GraphError;
use crate::graph::{CompiledGraph, END};
use crate::state::State;
use agentgraph_checkpoint::{Channel, CheckpointError};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

use super::types::{Task, TaskWrites};

/// Decide the active node set for a step and build one task per node.
///
/// Tasks are ordered lexicographically by node id. The ordering is a
/// tie-break for event emission and write application only; execution
/// itself is unordered and parallel.
pub fn plan_step(
    graph: &CompiledGraph,
    channels: &HashMap<String, Channel>,
    versions: &HashMap<String, u64>,
    versions_seen: &HashMap<String, HashMap<String, u64>>,
    state: &State,
    step: i64,
) -> Vec<Task> {
    let mut tasks = Vec::new();

    for node_id in graph.node_ids() {
        let triggers = graph.triggers_of(&node_id);
        let seen = versions_seen.get(&node_id);

        let fired = triggers.iter().any(|chan| {
            let available = channels.get(chan).is_some_and(Channel::is_available);
            if !available {
                return false;
            }
            let version = versions.get(chan).copied().unwrap_or(0);
            let high_water = seen
                .and_then(|s| s.get(chan))
                .copied()
                .unwrap_or(0);
            version > high_water
        });

        if !fired {
            continue;
        }

        let observed: HashMap<String, u64> = triggers
            .iter()
            .filter_map(|chan| versions.get(chan).map(|v| (chan.clone(), *v)))
            .collect();

        let spec = graph
            .node(&node_id)
            .expect("planned node is always declared");
        let max_attempts = spec
            .retry_policy
            .as_ref()
            .map(|p| p.max_attempts)
            .unwrap_or(1);

        tasks.push(Task {
            step,
            node_id: node_id.clone(),
            task_id: format!("{}:{}", step, node_id),
            triggers: triggers.to_vec(),
            observed,
            input: state.clone(),
            attempt: 1,
            max_attempts,
        });
    }

    tasks
}

/// A channel version change observed during write application, for event
/// emission by the loop.
#[derive(Debug, Clone)]
pub struct ChannelChange {
    pub channel: String,
    pub version: u64,
    pub behavior: &'static str,
    pub available: bool,
    /// A barrier that just filled.
    pub barrier_filled: bool,
}

/// Result of applying one step's writes.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Channels that advanced and are available (may trigger new tasks).
    pub updated_channels: BTreeSet<String>,
    /// State fields touched by reducer merges.
    pub updated_keys: Vec<String>,
    /// Version changes, in application order.
    pub channel_changes: Vec<ChannelChange>,
    /// Writes targeting channels that do not exist (diagnostic only).
    pub unknown_channels: Vec<String>,
    /// A task contributed an edge or goto to `End`.
    pub end_reached: bool,
    /// Failed tasks whose conditional edges still resolved a route.
    pub error_routed: BTreeSet<String>,
    /// First unmapped conditional/goto key, fatal after the step.
    pub planning_error: Option<GraphError>,
    /// Barrier overflow or other fatal channel violation.
    pub channel_error: Option<GraphError>,
    /// Total writes applied (state fields plus channel marks).
    pub writes_count: usize,
}

fn bump(
    versions: &mut HashMap<String, u64>,
    outcome: &mut ApplyOutcome,
    channels: &HashMap<String, Channel>,
    name: &str,
    next_version: u64,
) {
    versions.insert(name.to_string(), next_version);
    let (behavior, available, barrier_filled) = match channels.get(name) {
        Some(chan) => (
            chan.behavior(),
            chan.is_available(),
            matches!(chan, Channel::Barrier { .. }) && chan.is_available(),
        ),
        None => ("unknown", false, false),
    };
    if available {
        outcome.updated_channels.insert(name.to_string());
    }
    outcome.channel_changes.push(ChannelChange {
        channel: name.to_string(),
        version: next_version,
        behavior,
        available,
        barrier_filled,
    });
}

fn mark_channel(
    channels: &mut HashMap<String, Channel>,
    versions: &mut HashMap<String, u64>,
    outcome: &mut ApplyOutcome,
    next_version: u64,
    source_node: &str,
    channel_name: &str,
) {
    if channel_name == END {
        outcome.end_reached = true;
        return;
    }
    let write_result = match channels.get_mut(channel_name) {
        Some(chan) => chan.write(channel_name, json!(source_node)),
        None => {
            if !outcome.unknown_channels.iter().any(|c| c == channel_name) {
                tracing::warn!(
                    channel = channel_name,
                    node = source_node,
                    "write to unknown channel ignored"
                );
                outcome.unknown_channels.push(channel_name.to_string());
            }
            return;
        }
    };

    match write_result {
        Ok(true) => {
            outcome.writes_count += 1;
            bump(versions, outcome, channels, channel_name, next_version);
        }
        Ok(false) => {}
        Err(err @ CheckpointError::UnknownContributor { .. }) => {
            // Barrier overflow is fatal.
            if outcome.channel_error.is_none() {
                outcome.channel_error = Some(GraphError::Channel(err.to_string()));
            }
        }
        Err(err) => {
            if outcome.channel_error.is_none() {
                outcome.channel_error = Some(GraphError::Channel(err.to_string()));
            }
        }
    }
}

/// Apply the writes of all settled tasks of a step under the single-writer
/// discipline.
///
/// `writes` must be sorted by node id (the caller's tie-break order).
/// Repeating the application over the same inputs yields the same state:
/// reducers are idempotent and channel marks converge.
pub fn apply_writes(
    graph: &CompiledGraph,
    state: &mut State,
    channels: &mut HashMap<String, Channel>,
    versions: &mut HashMap<String, u64>,
    versions_seen: &mut HashMap<String, HashMap<String, u64>>,
    writes: &[TaskWrites],
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let next_version = versions.values().copied().max().unwrap_or(0) + 1;

    // 1. Record high-water-marks: each task has now seen its trigger
    //    channels at the versions observed at read time.
    for task in writes {
        let seen = versions_seen.entry(task.node_id.clone()).or_default();
        for (chan, version) in &task.observed {
            let entry = seen.entry(chan.clone()).or_insert(0);
            *entry = (*entry).max(*version);
        }
    }

    // 2. Consume triggered channels (barriers reset once full, topics
    //    drain). A consumed channel advances so its snapshot is current.
    for task in writes {
        for chan_name in &task.triggers {
            let consumed = channels
                .get_mut(chan_name)
                .is_some_and(|chan| chan.consume());
            if consumed {
                bump(versions, &mut outcome, channels, chan_name, next_version);
            }
        }
    }

    // 3. Reduce state updates in deterministic order.
    let mut updated_keys: BTreeSet<String> = BTreeSet::new();
    for task in writes {
        if let Some(update) = task.state_update() {
            graph.schema().apply_update(state, update);
            for key in update.keys() {
                if !crate::state::is_reserved(key) {
                    updated_keys.insert(key.clone());
                    outcome.writes_count += 1;
                }
            }
        }
    }
    outcome.updated_keys = updated_keys.into_iter().collect();

    // 4. Writer rules: static edges mark their branch channels, join
    //    contributors land in their barriers. Failed tasks contribute
    //    nothing here.
    for task in writes {
        if task.failed {
            continue;
        }
        for channel_name in graph.writers_of(&task.node_id) {
            mark_channel(
                channels,
                versions,
                &mut outcome,
                next_version,
                &task.node_id,
                channel_name,
            );
        }
        if graph.writes_to_end(&task.node_id) {
            outcome.end_reached = true;
        }
    }

    // 5. Conditional edges run against the post-update state.
    for task in writes {
        for edge in graph.conditional_edges_of(&task.node_id) {
            let keys = (edge.condition)(state);
            for key in keys {
                match graph.resolve_branch_key(&task.node_id, &key, Some(&edge.path_map)) {
                    Ok(target) => {
                        if task.failed {
                            outcome.error_routed.insert(task.node_id.clone());
                        }
                        let channel_name = if target == END {
                            END.to_string()
                        } else {
                            crate::graph::branch_channel(&target)
                        };
                        mark_channel(
                            channels,
                            versions,
                            &mut outcome,
                            next_version,
                            &task.node_id,
                            &channel_name,
                        );
                    }
                    Err(err) => {
                        tracing::warn!(node = %task.node_id, key = %key, "unmapped conditional branch key");
                        if outcome.planning_error.is_none() {
                            outcome.planning_error = Some(err);
                        }
                    }
                }
            }
        }
    }

    // 6. Dynamic goto commands resolve like conditional branches.
    for task in writes {
        if task.failed {
            continue;
        }
        let Some(goto) = task.command.as_ref().and_then(|c| c.goto.as_ref()) else {
            continue;
        };
        for key in goto.keys() {
            match graph.resolve_branch_key(&task.node_id, &key, None) {
                Ok(target) => {
                    let channel_name = if target == END {
                        END.to_string()
                    } else {
                        crate::graph::branch_channel(&target)
                    };
                    mark_channel(
                        channels,
                        versions,
                        &mut outcome,
                        next_version,
                        &task.node_id,
                        &channel_name,
                    );
                }
                Err(err) => {
                    tracing::warn!(node = %task.node_id, key = %key, "unmapped goto key");
                    if outcome.planning_error.is_none() {
                        outcome.planning_error = Some(err);
                    }
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{branch_channel, condition, GraphBuilder, START};
    use crate::node::{node_fn, NodeOutput};
    use crate::state::{FieldSpec, ReducerKind, StateSchema};
    use std::sync::Arc;

    fn noop() -> Arc<dyn crate::node::NodeFunction> {
        node_fn(|_state, _ctx| async move { Ok(NodeOutput::Empty) })
    }

    fn schema() -> StateSchema {
        StateSchema::new().field("x", FieldSpec::new(ReducerKind::LastValue))
    }

    fn writes_for(task_node: &str, update: Option<State>) -> TaskWrites {
        TaskWrites {
            node_id: task_node.to_string(),
            task_id: format!("0:{}", task_node),
            triggers: vec![branch_channel(task_node)],
            observed: HashMap::from([(branch_channel(task_node), 1u64)]),
            update,
            command: None,
            failed: false,
        }
    }

    #[test]
    fn planning_requires_available_and_newer_version() {
        let graph = GraphBuilder::new(schema())
            .add_node("a", noop())
            .add_edge(START, "a")
            .compile()
            .unwrap();

        let mut channels = graph.channels();
        let mut versions = HashMap::new();
        let versions_seen = HashMap::new();
        let state = State::new();

        // Nothing available yet.
        assert!(plan_step(&graph, &channels, &versions, &versions_seen, &state, 0).is_empty());

        // Available and newer than the (absent) high-water-mark.
        channels
            .get_mut(&branch_channel("a"))
            .unwrap()
            .write(&branch_channel("a"), json!("start"))
            .unwrap();
        versions.insert(branch_channel("a"), 1);

        let tasks = plan_step(&graph, &channels, &versions, &versions_seen, &state, 0);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].node_id, "a");
        assert_eq!(tasks[0].observed[&branch_channel("a")], 1);

        // Same version already seen: no re-trigger.
        let seen = HashMap::from([(
            "a".to_string(),
            HashMap::from([(branch_channel("a"), 1u64)]),
        )]);
        assert!(plan_step(&graph, &channels, &versions, &seen, &state, 1).is_empty());
    }

    #[test]
    fn apply_updates_state_and_marks_writers() {
        let graph = GraphBuilder::new(schema())
            .add_node("a", noop())
            .add_node("b", noop())
            .add_edge(START, "a")
            .add_edge("a", "b")
            .compile()
            .unwrap();

        let mut state = State::new();
        let mut channels = graph.channels();
        let mut versions = HashMap::new();
        let mut seen = HashMap::new();

        let writes = vec![writes_for(
            "a",
            Some(State::from([("x".to_string(), json!(7))])),
        )];
        let outcome = apply_writes(
            &graph,
            &mut state,
            &mut channels,
            &mut versions,
            &mut seen,
            &writes,
        );

        assert_eq!(state["x"], json!(7));
        assert!(outcome.updated_channels.contains(&branch_channel("b")));
        assert_eq!(outcome.updated_keys, vec!["x".to_string()]);
        assert_eq!(versions[&branch_channel("b")], 2);
        assert_eq!(seen["a"][&branch_channel("a")], 1);
        assert!(!outcome.end_reached);
    }

    #[test]
    fn static_edge_to_end_is_termination_not_a_write() {
        let graph = GraphBuilder::new(schema())
            .add_node("a", noop())
            .add_edge(START, "a")
            .add_edge("a", crate::graph::END)
            .compile()
            .unwrap();

        let mut state = State::new();
        let mut channels = graph.channels();
        let mut versions = HashMap::new();
        let mut seen = HashMap::new();

        let outcome = apply_writes(
            &graph,
            &mut state,
            &mut channels,
            &mut versions,
            &mut seen,
            &[writes_for("a", None)],
        );

        assert!(outcome.end_reached);
        assert!(outcome.updated_channels.is_empty());
    }

    #[test]
    fn conditional_runs_against_post_update_state() {
        let graph = GraphBuilder::new(schema())
            .add_node("router", noop())
            .add_node("hot", noop())
            .add_node("cold", noop())
            .add_edge(START, "router")
            .add_conditional_edges(
                "router",
                condition(|state| {
                    if state.get("x").and_then(Value::as_i64).unwrap_or(0) > 0 {
                        "toHot".to_string()
                    } else {
                        "toCold".to_string()
                    }
                }),
                HashMap::from([
                    ("toHot".to_string(), "hot".to_string()),
                    ("toCold".to_string(), "cold".to_string()),
                ]),
            )
            .compile()
            .unwrap();

        let mut state = State::new();
        let mut channels = graph.channels();
        let mut versions = HashMap::new();
        let mut seen = HashMap::new();

        // The router's own update flips the branch decision.
        let writes = vec![TaskWrites {
            node_id: "router".into(),
            task_id: "0:router".into(),
            triggers: vec![],
            observed: HashMap::new(),
            update: Some(State::from([("x".to_string(), json!(1))])),
            command: None,
            failed: false,
        }];
        let outcome = apply_writes(
            &graph,
            &mut state,
            &mut channels,
            &mut versions,
            &mut seen,
            &writes,
        );

        assert!(outcome.updated_channels.contains(&branch_channel("hot")));
        assert!(!outcome.updated_channels.contains(&branch_channel("cold")));
    }

    #[test]
    fn unmapped_branch_key_is_a_planning_error() {
        let graph = GraphBuilder::new(schema())
            .add_node("router", noop())
            .add_edge(START, "router")
            .add_conditional_edges(
                "router",
                condition(|_| "nowhere".to_string()),
                HashMap::new(),
            )
            .compile()
            .unwrap();

        let mut state = State::new();
        let mut channels = graph.channels();
        let mut versions = HashMap::new();
        let mut seen = HashMap::new();

        let outcome = apply_writes(
            &graph,
            &mut state,
            &mut channels,
            &mut versions,
            &mut seen,
            &[writes_for("router", None)],
        );

        assert!(matches!(
            outcome.planning_error,
            Some(GraphError::Planning { .. })
        ));
    }

    #[test]
    fn barrier_collects_contributors_across_steps() {
        let graph = GraphBuilder::new(schema())
            .add_node("split", noop())
            .add_node("a", noop())
            .add_node("b", noop())
            .add_node("c", noop())
            .add_edge(START, "split")
            .add_join_edge(["a", "b"], "c")
            .compile()
            .unwrap();

        let mut state = State::new();
        let mut channels = graph.channels();
        let mut versions = HashMap::new();
        let mut seen = HashMap::new();

        // Only `a` completes first: barrier not yet available.
        let outcome = apply_writes(
            &graph,
            &mut state,
            &mut channels,
            &mut versions,
            &mut seen,
            &[writes_for("a", None)],
        );
        let barrier: Vec<&String> = outcome
            .channel_changes
            .iter()
            .map(|c| &c.channel)
            .collect();
        assert_eq!(barrier.len(), 1);
        assert!(outcome.updated_channels.is_empty());

        // `b` completes next step: barrier fills and becomes available.
        let outcome = apply_writes(
            &graph,
            &mut state,
            &mut channels,
            &mut versions,
            &mut seen,
            &[writes_for("b", None)],
        );
        assert_eq!(outcome.updated_channels.len(), 1);
        assert!(outcome.channel_changes.iter().any(|c| c.barrier_filled));
    }

    #[test]
    fn goto_end_terminates() {
        let graph = GraphBuilder::new(schema())
            .add_node("a", noop())
            .add_edge(START, "a")
            .compile()
            .unwrap();

        let mut state = State::new();
        let mut channels = graph.channels();
        let mut versions = HashMap::new();
        let mut seen = HashMap::new();

        let writes = vec![TaskWrites {
            node_id: "a".into(),
            task_id: "0:a".into(),
            triggers: vec![],
            observed: HashMap::new(),
            update: None,
            command: Some(crate::command::Command::new().with_goto(crate::graph::END)),
            failed: false,
        }];
        let outcome = apply_writes(
            &graph,
            &mut state,
            &mut channels,
            &mut versions,
            &mut seen,
            &writes,
        );
        assert!(outcome.end_reached);
    }

    #[test]
    fn replay_is_idempotent() {
        let graph = GraphBuilder::new(schema())
            .add_node("a", noop())
            .add_node("b", noop())
            .add_edge(START, "a")
            .add_edge("a", "b")
            .compile()
            .unwrap();

        let writes = vec![writes_for(
            "a",
            Some(State::from([("x".to_string(), json!(3))])),
        )];

        let mut state1 = State::new();
        let mut channels1 = graph.channels();
        let mut versions1 = HashMap::new();
        let mut seen1 = HashMap::new();
        apply_writes(&graph, &mut state1, &mut channels1, &mut versions1, &mut seen1, &writes);

        // Apply the same recorded writes again to an identical snapshot.
        let mut state2 = state1.clone();
        let mut channels2 = channels1.clone();
        let mut versions2 = versions1.clone();
        let mut seen2 = seen1.clone();
        apply_writes(&graph, &mut state2, &mut channels2, &mut versions2, &mut seen2, &writes);

        assert_eq!(state1, state2);
        assert_eq!(channels1, channels2);
    }
}
