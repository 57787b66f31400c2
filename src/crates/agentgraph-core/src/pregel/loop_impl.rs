//! The superstep loop.
//!
//! One [`PregelLoop`] drives one run: plan → execute tasks in parallel →
//! apply writes → advance channel versions → decide the next step. The
//! loop owns the live state map, the channel map and the version
//! bookkeeping for the duration of the run; tasks only ever see deep-copied
//! snapshots, and all merging happens on the loop's own thread of control
//! between steps.
//!
//! Each step:
//!
//! 1. plan the active node set from channel availability and versions;
//! 2. honor static before-breakpoints and external interrupt requests;
//! 3. dispatch one concurrent task per planned node, with per-node retry
//!    and cooperative cancellation;
//! 4. collect settled tasks; a dynamic interrupt sentinel suspends the run
//!    with the step's completed writes recorded as pending;
//! 5. apply writes under the single-writer discipline;
//! 6. honor static after-breakpoints;
//! 7. persist a checkpoint (`input` on step 0, `loop` afterwards);
//! 8. terminate on quiescence, an `End` contribution, or a fatal error.

use crate::error::{GraphError, Result};
use crate::event::{
    object, ChannelMetadata, CheckpointEventMetadata, CompletionMetadata, EventEmitter,
    ExecutionEvent, NodeMetadata, PregelMetadata, StateMetadata,
};
use crate::graph::{trigger_channel, CompiledGraph};
use crate::interrupt::{InterruptPhase, InterruptState};
use crate::node::{
    cancel_pair, CancelHandle, ExecContext, NodeContext, NodeError, NodeFunction, ResumeView,
};
use crate::retry::RetryPolicy;
use crate::state::{is_reserved, reserved, State};
use agentgraph_checkpoint::{
    Channel, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    IncludeContents, PendingWrite,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::algo::{apply_writes, plan_step, ApplyOutcome};
use super::types::{Invocation, Task, TaskOutcome, TaskWrites};

/// Reserved keys never written into persisted or serialized state views.
const NON_PERSISTED_KEYS: [&str; 4] = [
    reserved::EXEC_CONTEXT,
    reserved::SESSION,
    reserved::CALLBACKS,
    reserved::PARENT_AGENT,
];

/// Key under which the state map travels inside checkpoint channel values.
const STATE_SNAPSHOT_KEY: &str = "__state__";

pub(crate) struct PregelLoop {
    graph: Arc<CompiledGraph>,
    saver: Option<Arc<dyn CheckpointSaver>>,
    invocation: Invocation,
    emitter: EventEmitter,
    state: State,
    channels: HashMap<String, Channel>,
    versions: HashMap<String, u64>,
    versions_seen: HashMap<String, HashMap<String, u64>>,
    step: i64,
    resume: ResumeView,
    used_interrupts: HashSet<String>,
    skip_static: Option<InterruptState>,
    replay_writes: Vec<TaskWrites>,
}

impl PregelLoop {
    /// Build a loop for a fresh run: defaults applied, entry node seeded.
    pub(crate) fn fresh(
        graph: Arc<CompiledGraph>,
        saver: Option<Arc<dyn CheckpointSaver>>,
        mut state: State,
        invocation: Invocation,
        emitter: EventEmitter,
    ) -> Result<Self> {
        graph.schema().initialize(&mut state)?;
        for (key, value) in &invocation.runtime_state {
            state.insert(key.clone(), value.clone());
        }

        let mut channels = graph.channels();
        let mut versions = HashMap::new();

        // Seed the entry trigger so the first plan activates the entry node.
        let entry_trigger = trigger_channel(graph.entry());
        if let Some(chan) = channels.get_mut(&entry_trigger) {
            chan.write(&entry_trigger, json!(crate::graph::START))
                .map_err(|e| GraphError::Channel(e.to_string()))?;
            versions.insert(entry_trigger, 1);
        }

        Ok(Self {
            graph,
            saver,
            invocation,
            emitter,
            state,
            channels,
            versions,
            versions_seen: HashMap::new(),
            step: 0,
            resume: ResumeView::default(),
            used_interrupts: HashSet::new(),
            skip_static: None,
            replay_writes: Vec::new(),
        })
    }

    /// Build a loop that continues from a persisted checkpoint.
    pub(crate) async fn resuming(
        graph: Arc<CompiledGraph>,
        saver: Option<Arc<dyn CheckpointSaver>>,
        extra_state: State,
        invocation: Invocation,
        checkpoint_id: Option<String>,
        command: crate::command::Command,
        emitter: EventEmitter,
    ) -> Result<Self> {
        let saver_ref = saver
            .as_ref()
            .ok_or_else(|| GraphError::Execution("resume requires a checkpoint saver".into()))?;

        let config = invocation.run_options.checkpoint.clone();
        let tuple = match &checkpoint_id {
            Some(id) => {
                let config = config.clone().with_checkpoint_id(id.clone());
                saver_ref.get_tuple(&config).await?
            }
            None => saver_ref.latest_interrupted(&config).await?,
        };
        let tuple = tuple.ok_or_else(|| {
            GraphError::Execution("no checkpoint found to resume from".into())
        })?;

        let checkpoint = tuple.checkpoint;

        let mut state: State = checkpoint
            .channel_values
            .get(STATE_SNAPSHOT_KEY)
            .and_then(Value::as_object)
            .map(|obj| obj.clone().into_iter().collect())
            .unwrap_or_default();

        let mut channels = graph.channels();
        for (name, snapshot) in &checkpoint.channel_values {
            if name == STATE_SNAPSHOT_KEY {
                continue;
            }
            match channels.get_mut(name) {
                Some(chan) => chan
                    .restore(name, snapshot.clone())
                    .map_err(|e| GraphError::Channel(e.to_string()))?,
                None => {
                    tracing::warn!(channel = %name, "checkpointed channel absent from compiled graph");
                }
            }
        }

        let interrupt_state: Option<InterruptState> = checkpoint
            .interrupt_state
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let used_interrupts: HashSet<String> = state
            .get(reserved::USED_INTERRUPTS)
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        // The resume map: the command's values, with any values supplied
        // through the checkpoint configuration underneath.
        let default_key = interrupt_state
            .as_ref()
            .map(|i| i.key.clone())
            .unwrap_or_default();
        let mut resume_map: HashMap<String, Value> = config
            .extra
            .get("resume_map")
            .and_then(Value::as_object)
            .map(|obj| obj.clone().into_iter().collect())
            .unwrap_or_default();
        resume_map.extend(command.resume_map(&default_key));

        let replay_writes: Vec<TaskWrites> = checkpoint
            .pending_writes
            .iter()
            .filter_map(|(task_id, node_id, value)| {
                match serde_json::from_value::<TaskWrites>(value.clone()) {
                    Ok(writes) => Some(writes),
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, node_id = %node_id, error = %e,
                            "dropping unparseable pending write");
                        None
                    }
                }
            })
            .collect();

        let skip_static = interrupt_state.clone().filter(|i| {
            matches!(i.phase, InterruptPhase::Before | InterruptPhase::After)
        });

        // Caller-supplied state and command updates merge as normal updates.
        graph.schema().apply_update(&mut state, &extra_state);
        if let Some(update) = &command.update {
            graph.schema().apply_update(&mut state, update);
        }
        for (key, value) in &invocation.runtime_state {
            state.insert(key.clone(), value.clone());
        }
        state.insert(
            reserved::COMMAND.to_string(),
            serde_json::to_value(&command)?,
        );
        state.insert(
            reserved::RESUME_MAP.to_string(),
            serde_json::to_value(&resume_map)?,
        );

        let step = checkpoint_step(&tuple.metadata);

        Ok(Self {
            graph,
            saver,
            invocation,
            emitter,
            state,
            channels,
            versions: checkpoint.channel_versions,
            versions_seen: checkpoint.versions_seen,
            step,
            resume: ResumeView::new(resume_map, used_interrupts.clone()),
            used_interrupts,
            skip_static,
            replay_writes,
        })
    }

    /// Drive the run to termination, emitting events along the way.
    pub(crate) async fn run(mut self) {
        if let Err(err) = self.run_inner().await {
            let view = self.final_state_view();
            self.emitter.emit(ExecutionEvent::completion(
                self.emitter.invocation_id(),
                &CompletionMetadata {
                    final_state: Some(&view),
                    error: Some(&err.to_string()),
                    done: true,
                },
            ));
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        // Replay writes recorded at interrupt time before planning; the
        // merge is idempotent, so a crash between replay and completion
        // re-replays harmlessly.
        if !self.replay_writes.is_empty() {
            let mut writes = std::mem::take(&mut self.replay_writes);
            writes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            let outcome = apply_writes(
                &self.graph,
                &mut self.state,
                &mut self.channels,
                &mut self.versions,
                &mut self.versions_seen,
                &writes,
            );
            self.emit_channel_events(&outcome);
        }

        loop {
            if self.step >= self.invocation.run_options.max_steps as i64 {
                return Err(GraphError::Execution(format!(
                    "maximum steps ({}) exceeded",
                    self.invocation.run_options.max_steps
                )));
            }
            if let Some(control) = &self.invocation.control {
                if control.cancel_requested() {
                    return Err(GraphError::Cancelled);
                }
            }

            let mut tasks = plan_step(
                &self.graph,
                &self.channels,
                &self.versions,
                &self.versions_seen,
                &self.state,
                self.step,
            );
            let planned: Vec<String> = tasks.iter().map(|t| t.node_id.clone()).collect();

            if tasks.is_empty() {
                // Quiescence: no channel became available.
                break;
            }

            self.emit_pregel(object::PREGEL_STEP, "step", &planned);
            self.emit_pregel(object::PREGEL_PLANNING, "planning", &planned);

            // External out-of-band interrupt: honored at the step boundary.
            if self
                .invocation
                .control
                .as_ref()
                .is_some_and(|c| c.interrupt_requested())
            {
                let interrupt =
                    InterruptState::static_breakpoint(InterruptPhase::Before, planned.clone());
                return self.suspend(interrupt, Vec::new()).await;
            }

            // Static before-breakpoints.
            let flagged_before: Vec<String> = planned
                .iter()
                .filter(|id| {
                    self.graph
                        .node(id)
                        .is_some_and(|spec| spec.interrupt_before)
                })
                .cloned()
                .collect();
            if !flagged_before.is_empty() && !self.consume_skip(InterruptPhase::Before, &planned) {
                let interrupt =
                    InterruptState::static_breakpoint(InterruptPhase::Before, planned.clone());
                return self.suspend(interrupt, Vec::new()).await;
            }

            let step_started = Instant::now();
            self.emit_pregel(object::PREGEL_EXECUTION, "execute", &planned);

            for task in &mut tasks {
                task.input
                    .insert(reserved::CURRENT_NODE.to_string(), json!(task.node_id));
            }
            for task in &tasks {
                self.emitter.emit(ExecutionEvent::node_start(
                    self.emitter.invocation_id(),
                    &self.node_meta(task, task.attempt),
                ));
            }

            let outcomes = self.dispatch(&tasks).await;
            self.used_interrupts.extend(self.resume.consumed());

            // Emission order per node: start → custom* → complete | error.
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(_) => self.emitter.emit(ExecutionEvent::node_complete(
                        self.emitter.invocation_id(),
                        &self.node_meta(&outcome.task, outcome.attempts),
                    )),
                    Err(NodeError::Interrupt { .. }) => {}
                    Err(err) => self.emitter.emit(ExecutionEvent::node_error(
                        self.emitter.invocation_id(),
                        &self.node_meta(&outcome.task, outcome.attempts),
                        error_kind(err),
                        err.to_string(),
                    )),
                }
            }

            // A dynamic interrupt suspends the run; completed siblings'
            // writes are recorded as pending and replayed on resume.
            let interrupting = outcomes
                .iter()
                .find(|o| matches!(o.result, Err(NodeError::Interrupt { .. })));
            if let Some(outcome) = interrupting {
                let (key, value) = match &outcome.result {
                    Err(NodeError::Interrupt { key, value }) => (key.clone(), value.clone()),
                    _ => unreachable!("filtered on interrupt variant"),
                };
                let pending: Vec<TaskWrites> = outcomes
                    .iter()
                    .filter_map(|o| match &o.result {
                        Ok(output) => Some(TaskWrites::from_output(&o.task, output)),
                        Err(_) => None,
                    })
                    .collect();
                let interrupt = InterruptState::dynamic(
                    outcome.task.node_id.clone(),
                    outcome.task.task_id.clone(),
                    key,
                    value,
                    vec![outcome.task.node_id.clone()],
                );
                return self.suspend(interrupt, pending).await;
            }

            if outcomes
                .iter()
                .any(|o| matches!(o.result, Err(NodeError::Cancelled)))
                && self
                    .invocation
                    .control
                    .as_ref()
                    .is_some_and(|c| c.cancel_requested())
            {
                return Err(GraphError::Cancelled);
            }

            // Apply writes: successful tasks contribute updates and marks,
            // failed tasks only advance their high-water-marks and run
            // their conditionals.
            let mut writes: Vec<TaskWrites> = Vec::new();
            let mut failures: Vec<(&Task, u32, &NodeError)> = Vec::new();
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(output) => writes.push(TaskWrites::from_output(&outcome.task, output)),
                    Err(err) => {
                        writes.push(TaskWrites::from_failure(&outcome.task));
                        failures.push((&outcome.task, outcome.attempts, err));
                    }
                }
            }
            writes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

            let outcome = apply_writes(
                &self.graph,
                &mut self.state,
                &mut self.channels,
                &mut self.versions,
                &mut self.versions_seen,
                &writes,
            );

            self.emit_channel_events(&outcome);
            self.emit_pregel(object::PREGEL_UPDATE, "update", &planned);
            self.emitter.emit(ExecutionEvent::state_update(
                self.emitter.invocation_id(),
                &StateMetadata {
                    step: self.step,
                    updated_keys: &outcome.updated_keys,
                },
            ));

            if let Some(err) = outcome.channel_error {
                return Err(err);
            }

            // Planning errors and unrouted node failures are fatal once the
            // step has fully settled; no step-boundary checkpoint is
            // persisted for a failed step.
            if let Some(err) = outcome.planning_error {
                return Err(err);
            }
            let unrouted = |(task, _, _): &&(&Task, u32, &NodeError)| {
                !outcome.error_routed.contains(&task.node_id)
            };
            let root_failure = failures
                .iter()
                .filter(|f| matches!(f.2, NodeError::Failed(_)))
                .find(unrouted)
                .or_else(|| failures.iter().find(unrouted));
            if let Some((task, attempts, err)) = root_failure {
                return Err(match err {
                    NodeError::Cancelled => GraphError::Cancelled,
                    other => GraphError::user_node(&task.node_id, *attempts, other.to_string()),
                });
            }

            // Static after-breakpoints, over the just-completed set.
            let completed: Vec<String> = outcomes
                .iter()
                .filter(|o| o.result.is_ok())
                .map(|o| o.task.node_id.clone())
                .collect();
            let flagged_after: Vec<String> = completed
                .iter()
                .filter(|id| {
                    self.graph
                        .node(id)
                        .is_some_and(|spec| spec.interrupt_after)
                })
                .cloned()
                .collect();
            if !flagged_after.is_empty() && !self.consume_skip(InterruptPhase::After, &completed) {
                let interrupt =
                    InterruptState::static_breakpoint(InterruptPhase::After, completed.clone());
                return self.suspend(interrupt, Vec::new()).await;
            }

            // Step-boundary checkpoint.
            let duration_ms = step_started.elapsed().as_millis() as u64;
            let source = if self.step == 0 {
                CheckpointSource::Input
            } else {
                CheckpointSource::Loop
            };
            self.persist(source, Vec::new(), None, duration_ms, outcome.writes_count)
                .await?;

            if outcome.end_reached {
                break;
            }

            self.step += 1;
        }

        let view = self.final_state_view();
        self.emitter.emit(ExecutionEvent::completion(
            self.emitter.invocation_id(),
            &CompletionMetadata {
                final_state: Some(&view),
                error: None,
                done: true,
            },
        ));
        Ok(())
    }

    /// Run every task of the step concurrently and settle them all.
    async fn dispatch(&self, tasks: &[Task]) -> Vec<TaskOutcome> {
        let (step_cancel, step_token) = cancel_pair();
        let watcher = self.spawn_control_watcher(step_cancel.clone());

        let exec = ExecContext {
            invocation_id: self.invocation.invocation_id.clone(),
            session: self.invocation.session.clone(),
            lineage_id: self.invocation.run_options.checkpoint.lineage_id.clone(),
            namespace: self
                .invocation
                .run_options
                .checkpoint
                .namespace()
                .to_string(),
            saver: self.saver.clone(),
            call_options: self.invocation.run_options.call_options.clone(),
        };

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let spec = self
                .graph
                .node(&task.node_id)
                .expect("planned node is always declared");
            let function = spec.function.clone();
            let policy = spec.retry_policy.clone();
            let options_view = self
                .invocation
                .run_options
                .call_options
                .resolve(&task.node_id);
            let ctx_template = (
                self.resume.clone(),
                options_view,
                step_token.clone(),
                exec.clone(),
                self.emitter.clone(),
            );
            let task = task.clone();
            let cancel_on_error = self.invocation.run_options.cancel_siblings_on_error;
            let sibling_cancel = step_cancel.clone();

            handles.push(tokio::spawn(async move {
                let outcome =
                    run_task(function, policy, task, ctx_template).await;
                if cancel_on_error && matches!(outcome.result, Err(NodeError::Failed(_))) {
                    sibling_cancel.cancel();
                }
                outcome
            }));
        }

        // The step barrier: every task terminates (success, error, or
        // cancellation) before the step can end.
        let mut outcomes = Vec::with_capacity(handles.len());
        for (handle, task) in handles.into_iter().zip(tasks.iter()) {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    tracing::warn!(node = %task.node_id, error = %join_err, "task aborted");
                    outcomes.push(TaskOutcome {
                        task: task.clone(),
                        attempts: task.attempt,
                        result: Err(NodeError::failed(format!(
                            "task aborted: {}",
                            join_err
                        ))),
                        consumed_resume_keys: Vec::new(),
                    });
                }
            }
        }

        if let Some(watcher) = watcher {
            watcher.abort();
        }

        outcomes.sort_by(|a, b| a.task.node_id.cmp(&b.task.node_id));
        outcomes
    }

    fn spawn_control_watcher(
        &self,
        step_cancel: CancelHandle,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let control = self.invocation.control.clone()?;
        Some(tokio::spawn(async move {
            loop {
                if control.cancel_requested() {
                    step_cancel.cancel();
                    break;
                }
                if control.interrupt_requested() {
                    match control.interrupt_timeout() {
                        Some(deadline) => {
                            tokio::time::sleep(deadline).await;
                            step_cancel.cancel();
                        }
                        None => {}
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }))
    }

    /// Whether a pending skip marker covers this plan at this phase; the
    /// marker is consumed either way once it matches the phase.
    fn consume_skip(&mut self, phase: InterruptPhase, nodes: &[String]) -> bool {
        let covers = self.skip_static.as_ref().is_some_and(|skip| {
            skip.phase == phase && nodes.iter().all(|n| skip.next_nodes.contains(n))
        });
        if covers {
            self.skip_static = None;
        }
        covers
    }

    /// Persist an interrupt checkpoint and terminate cleanly.
    async fn suspend(
        &mut self,
        interrupt: InterruptState,
        pending: Vec<TaskWrites>,
    ) -> Result<()> {
        self.state.insert(
            reserved::NEXT_NODES.to_string(),
            json!(interrupt.next_nodes),
        );

        let pending_writes: Vec<PendingWrite> = pending
            .iter()
            .map(|writes| {
                (
                    writes.task_id.clone(),
                    writes.node_id.clone(),
                    serde_json::to_value(writes).unwrap_or(Value::Null),
                )
            })
            .collect();
        let writes_count = pending_writes.len();

        self.persist(
            CheckpointSource::Interrupt,
            pending_writes,
            Some(&interrupt),
            0,
            writes_count,
        )
        .await?;

        let view = self.final_state_view();
        self.emitter.emit(ExecutionEvent::completion(
            self.emitter.invocation_id(),
            &CompletionMetadata {
                final_state: Some(&view),
                error: None,
                done: false,
            },
        ));
        Ok(())
    }

    /// Persist one checkpoint. A saver failure is reported through the
    /// event stream and is fatal only when configured so.
    async fn persist(
        &mut self,
        source: CheckpointSource,
        pending_writes: Vec<PendingWrite>,
        interrupt: Option<&InterruptState>,
        duration_ms: u64,
        writes_count: usize,
    ) -> Result<()> {
        // Mirror the resume-protocol bookkeeping into reserved state so it
        // survives into the checkpoint.
        let mut used: Vec<&String> = self.used_interrupts.iter().collect();
        used.sort();
        self.state
            .insert(reserved::USED_INTERRUPTS.to_string(), json!(used));

        let interrupt_value = match interrupt {
            Some(state) => Some(serde_json::to_value(state)?),
            None => None,
        };

        let config = &self.invocation.run_options.checkpoint;
        let (Some(saver), Some(lineage_id)) = (&self.saver, &config.lineage_id) else {
            // No persistence configured; still surface the interrupt event.
            if let Some(value) = &interrupt_value {
                self.emit_checkpoint_event(object::CHECKPOINT_INTERRUPT, "", source, Some(value));
            }
            return Ok(());
        };
        let lineage_id = lineage_id.clone();

        let channel_values = self.checkpoint_channel_values();
        let bytes = serde_json::to_vec(&channel_values).map(|v| v.len()).ok();

        let mut checkpoint = Checkpoint::new(
            uuid::Uuid::new_v4().to_string(),
            channel_values,
            self.versions.clone(),
            self.versions_seen.clone(),
        )
        .with_pending_writes(pending_writes);
        if let Some(value) = interrupt_value.clone() {
            checkpoint = checkpoint.with_interrupt_state(value);
        }
        let checkpoint_id = checkpoint.id.clone();

        let mut metadata = CheckpointMetadata::new()
            .with_source(source)
            .with_step(self.step)
            .with_writes_count(writes_count)
            .with_duration_ms(duration_ms);
        if let Some(bytes) = bytes {
            metadata = metadata.with_bytes(bytes);
        }

        self.emit_checkpoint_event(object::CHECKPOINT_CREATED, &checkpoint_id, source, None);

        let put_config = CheckpointConfig {
            lineage_id: Some(lineage_id),
            checkpoint_id: None,
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: HashMap::new(),
        };
        match saver
            .put(&put_config, checkpoint, metadata, self.versions.clone())
            .await
        {
            Ok(_stored) => {
                self.emit_checkpoint_event(
                    object::CHECKPOINT_COMMITTED,
                    &checkpoint_id,
                    source,
                    None,
                );
                if let Some(value) = &interrupt_value {
                    self.emit_checkpoint_event(
                        object::CHECKPOINT_INTERRUPT,
                        &checkpoint_id,
                        source,
                        Some(value),
                    );
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint put failed");
                let event = ExecutionEvent::checkpoint(
                    self.emitter.invocation_id(),
                    object::CHECKPOINT_COMMITTED,
                    &CheckpointEventMetadata {
                        checkpoint_id: &checkpoint_id,
                        lineage_id: config.lineage_id.as_deref().unwrap_or(""),
                        namespace: config.namespace(),
                        source: source_tag(source),
                        step: self.step,
                        interrupt: None,
                    },
                )
                .with_error("checkpoint", e.to_string());
                self.emitter.emit(event);

                if self.invocation.run_options.fail_on_checkpoint_error {
                    Err(GraphError::Checkpoint(e))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn checkpoint_channel_values(&self) -> HashMap<String, Value> {
        let include = self.invocation.run_options.include_contents;
        if include == IncludeContents::None {
            return HashMap::new();
        }

        let mut values: HashMap<String, Value> = self
            .channels
            .iter()
            .map(|(name, chan)| (name.clone(), chan.checkpoint()))
            .collect();

        let state_view: serde_json::Map<String, Value> = self
            .state
            .iter()
            .filter(|(key, _)| {
                include == IncludeContents::All
                    || !NON_PERSISTED_KEYS.contains(&key.as_str())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        values.insert(STATE_SNAPSHOT_KEY.to_string(), Value::Object(state_view));
        values
    }

    fn emit_channel_events(&self, outcome: &ApplyOutcome) {
        for change in &outcome.channel_changes {
            let meta = ChannelMetadata {
                channel: &change.channel,
                version: change.version,
                behavior: change.behavior,
                available: change.available,
            };
            self.emitter.emit(ExecutionEvent::channel_update(
                self.emitter.invocation_id(),
                &meta,
            ));
            if change.barrier_filled {
                self.emitter
                    .emit(ExecutionEvent::barrier(self.emitter.invocation_id(), &meta));
            }
        }
        for channel in &outcome.unknown_channels {
            let meta = ChannelMetadata {
                channel,
                version: 0,
                behavior: "unknown",
                available: false,
            };
            self.emitter.emit(
                ExecutionEvent::channel_update(self.emitter.invocation_id(), &meta)
                    .with_error("channel", format!("write to unknown channel '{}'", channel)),
            );
        }
    }

    fn emit_pregel(&self, object: &str, phase: &str, nodes: &[String]) {
        self.emitter.emit(ExecutionEvent::pregel(
            self.emitter.invocation_id(),
            object,
            &PregelMetadata {
                step: self.step,
                phase,
                nodes,
            },
        ));
    }

    fn emit_checkpoint_event(
        &self,
        object: &str,
        checkpoint_id: &str,
        source: CheckpointSource,
        interrupt: Option<&Value>,
    ) {
        let config = &self.invocation.run_options.checkpoint;
        self.emitter.emit(ExecutionEvent::checkpoint(
            self.emitter.invocation_id(),
            object,
            &CheckpointEventMetadata {
                checkpoint_id,
                lineage_id: config.lineage_id.as_deref().unwrap_or(""),
                namespace: config.namespace(),
                source: source_tag(source),
                step: self.step,
                interrupt,
            },
        ));
    }

    fn node_meta<'a>(&self, task: &'a Task, attempt: u32) -> NodeMetadata<'a> {
        NodeMetadata {
            node_id: &task.node_id,
            task_id: &task.task_id,
            step: self.step,
            attempt,
        }
    }

    /// Serialized view of the final state: reserved keys and
    /// non-serializable entries excluded.
    fn final_state_view(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .state
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

fn checkpoint_step(metadata: &CheckpointMetadata) -> i64 {
    metadata.step.unwrap_or(0).max(0)
}

fn source_tag(source: CheckpointSource) -> &'static str {
    match source {
        CheckpointSource::Input => "input",
        CheckpointSource::Loop => "loop",
        CheckpointSource::Interrupt => "interrupt",
    }
}

fn error_kind(err: &NodeError) -> &'static str {
    match err {
        NodeError::Interrupt { .. } => "interrupt",
        NodeError::Cancelled => "cancelled",
        NodeError::Failed(_) => "user_node",
    }
}

/// Execute one task with its retry policy, preserving task identity
/// across attempts.
async fn run_task(
    function: Arc<dyn NodeFunction>,
    policy: Option<RetryPolicy>,
    task: Task,
    ctx_template: (
        ResumeView,
        Value,
        crate::node::CancelToken,
        ExecContext,
        EventEmitter,
    ),
) -> TaskOutcome {
    let (resume, options_view, token, exec, emitter) = ctx_template;
    let mut attempt = task.attempt;

    loop {
        let ctx = NodeContext::new(
            task.node_id.clone(),
            task.task_id.clone(),
            task.step,
            attempt,
            resume.clone(),
            options_view.clone(),
            token.clone(),
            exec.clone(),
            Some(emitter.clone()),
        );

        let result = tokio::select! {
            result = function.run(task.input.clone(), ctx) => result,
            _ = token.cancelled() => Err(NodeError::Cancelled),
        };

        match result {
            Ok(output) => {
                return TaskOutcome {
                    consumed_resume_keys: resume.consumed().into_iter().collect(),
                    task,
                    attempts: attempt,
                    result: Ok(output),
                };
            }
            Err(err) => {
                let retry = policy
                    .as_ref()
                    .is_some_and(|p| p.should_retry(attempt, &err));
                if retry {
                    let policy = policy.as_ref().expect("retry implies policy");
                    tracing::debug!(node = %task.node_id, attempt, "retrying node after error");
                    emitter.emit(ExecutionEvent::node_execution(
                        emitter.invocation_id(),
                        &NodeMetadata {
                            node_id: &task.node_id,
                            task_id: &task.task_id,
                            step: task.step,
                            attempt: attempt + 1,
                        },
                    ));
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return TaskOutcome {
                    consumed_resume_keys: resume.consumed().into_iter().collect(),
                    task,
                    attempts: attempt,
                    result: Err(err),
                };
            }
        }
    }
}
