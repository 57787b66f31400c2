//! Graph construction and the immutable compiled form.
//!
//! A [`GraphBuilder`] collects nodes and edges; [`GraphBuilder::compile`]
//! validates the shape and produces a [`CompiledGraph`]: read-only lookups
//! for nodes, triggers, writers, conditional edges and the initial channel
//! map. Everything the executor schedules over is derived here:
//!
//! - a static edge `from → to` becomes one writer on `from` and one
//!   trigger on `to`, both via the channel `branch:to:<to>`;
//! - a join edge `{starts} ⇒ to` becomes a barrier channel whose expected
//!   contributor set is the normalized start set;
//! - conditional edges keep their condition function and path map and are
//!   evaluated against post-update state at write-application time;
//! - the entry sentinel [`START`] must have exactly one outbound edge; an
//!   edge to [`END`] is a termination contribution, not a channel write.

use crate::error::{GraphError, Result};
use crate::node::NodeFunction;
use crate::retry::RetryPolicy;
use crate::state::{State, StateSchema};
use agentgraph_checkpoint::Channel;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Entry sentinel.
pub const START: &str = "__start__";
/// Terminal sentinel.
pub const END: &str = "__end__";

/// Node identifier.
pub type NodeId = String;

/// Channel fed by edges targeting `node`.
pub fn branch_channel(node: &str) -> String {
    format!("branch:to:{}", node)
}

/// Per-node trigger channel (used to seed the entry node).
pub fn trigger_channel(node: &str) -> String {
    format!("trigger:{}", node)
}

/// Externally-fed input channel.
pub fn input_channel(name: &str) -> String {
    format!("input:{}", name)
}

/// Deterministic, collision-free barrier channel name for a join edge.
/// Derived from the target plus the normalized (sorted) start set.
pub fn join_channel(to: &str, starts: &BTreeSet<String>) -> String {
    let mut joined = String::new();
    for (i, start) in starts.iter().enumerate() {
        if i > 0 {
            joined.push('+');
        }
        joined.push_str(start);
    }
    format!("branch:join:{}:{}", to, joined)
}

/// Node type tag. The core treats LLM and tool functions as opaque; the
/// kind exists for introspection and event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Function,
    Llm,
    Tool,
    Agent,
    Router,
    Join,
}

/// Branch condition evaluated against post-update state. Returns one or
/// more branch keys.
pub type ConditionFn = Arc<dyn Fn(&State) -> Vec<String> + Send + Sync>;

/// Derives a cache key from a node's input snapshot. The core records the
/// selector on the compiled node; task caches living outside the core
/// consume it.
pub type CacheKeySelector = Arc<dyn Fn(&State) -> String + Send + Sync>;

/// Wrap a closure returning a single branch key.
pub fn condition<F>(f: F) -> ConditionFn
where
    F: Fn(&State) -> String + Send + Sync + 'static,
{
    Arc::new(move |state| vec![f(state)])
}

/// Wrap a closure returning multiple branch keys.
pub fn multi_condition<F>(f: F) -> ConditionFn
where
    F: Fn(&State) -> Vec<String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A conditional edge attached to a source node.
#[derive(Clone)]
pub struct ConditionalEdge {
    pub source: NodeId,
    pub condition: ConditionFn,
    pub path_map: HashMap<String, String>,
}

impl fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("source", &self.source)
            .field("path_map", &self.path_map)
            .finish()
    }
}

/// A compiled node. Immutable after compile.
#[derive(Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    pub function: Arc<dyn NodeFunction>,
    /// Channels this node subscribes to.
    pub triggers: Vec<String>,
    /// Channels marked updated when this node completes.
    pub writers: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub interrupt_before: bool,
    pub interrupt_after: bool,
    /// Branch-key → target fallback used by conditionals and `goto`.
    pub ends_map: HashMap<String, String>,
    pub cache_key: Option<CacheKeySelector>,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("triggers", &self.triggers)
            .field("writers", &self.writers)
            .field("interrupt_before", &self.interrupt_before)
            .field("interrupt_after", &self.interrupt_after)
            .finish()
    }
}

struct NodeDraft {
    kind: NodeKind,
    function: Arc<dyn NodeFunction>,
    retry_policy: Option<RetryPolicy>,
    interrupt_before: bool,
    interrupt_after: bool,
    ends_map: HashMap<String, String>,
    cache_key: Option<CacheKeySelector>,
}

/// Collects graph shape before compilation.
#[derive(Default)]
pub struct GraphBuilder {
    schema: StateSchema,
    drafts: BTreeMap<NodeId, NodeDraft>,
    static_edges: Vec<(String, String)>,
    conditional: Vec<ConditionalEdge>,
    joins: Vec<(BTreeSet<String>, String)>,
}

impl GraphBuilder {
    pub fn new(schema: StateSchema) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    pub fn add_node(self, id: impl Into<String>, function: Arc<dyn NodeFunction>) -> Self {
        self.add_node_kind(id, NodeKind::Function, function)
    }

    pub fn add_node_kind(
        mut self,
        id: impl Into<String>,
        kind: NodeKind,
        function: Arc<dyn NodeFunction>,
    ) -> Self {
        self.drafts.insert(
            id.into(),
            NodeDraft {
                kind,
                function,
                retry_policy: None,
                interrupt_before: false,
                interrupt_after: false,
                ends_map: HashMap::new(),
                cache_key: None,
            },
        );
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.static_edges.push((from.into(), to.into()));
        self
    }

    pub fn add_conditional_edges(
        mut self,
        source: impl Into<String>,
        condition: ConditionFn,
        path_map: HashMap<String, String>,
    ) -> Self {
        self.conditional.push(ConditionalEdge {
            source: source.into(),
            condition,
            path_map,
        });
        self
    }

    /// `{starts} ⇒ to`: `to` fires only after every start has completed.
    pub fn add_join_edge<I, S>(mut self, starts: I, to: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let starts: BTreeSet<String> = starts.into_iter().map(Into::into).collect();
        self.joins.push((starts, to.into()));
        self
    }

    pub fn set_retry(mut self, node: &str, policy: RetryPolicy) -> Self {
        if let Some(draft) = self.drafts.get_mut(node) {
            draft.retry_policy = Some(policy);
        }
        self
    }

    pub fn set_interrupt_before(mut self, node: &str) -> Self {
        if let Some(draft) = self.drafts.get_mut(node) {
            draft.interrupt_before = true;
        }
        self
    }

    pub fn set_interrupt_after(mut self, node: &str) -> Self {
        if let Some(draft) = self.drafts.get_mut(node) {
            draft.interrupt_after = true;
        }
        self
    }

    pub fn set_ends_map(mut self, node: &str, ends_map: HashMap<String, String>) -> Self {
        if let Some(draft) = self.drafts.get_mut(node) {
            draft.ends_map = ends_map;
        }
        self
    }

    pub fn set_cache_key(mut self, node: &str, selector: CacheKeySelector) -> Self {
        if let Some(draft) = self.drafts.get_mut(node) {
            draft.cache_key = Some(selector);
        }
        self
    }

    fn check_declared(&self, what: &str, id: &str) -> Result<()> {
        if id == END || self.drafts.contains_key(id) {
            Ok(())
        } else {
            Err(GraphError::Validation(format!(
                "{} refers to undeclared node '{}'",
                what, id
            )))
        }
    }

    /// Validate the declared shape and produce the immutable compiled form.
    pub fn compile(self) -> Result<CompiledGraph> {
        // Entry: Start must have exactly one outbound edge.
        let entry_edges: Vec<&(String, String)> = self
            .static_edges
            .iter()
            .filter(|(from, _)| from == START)
            .collect();
        let entry = match entry_edges.as_slice() {
            [(_, to)] => {
                if to == END {
                    return Err(GraphError::Validation(
                        "entry edge may not target End".to_string(),
                    ));
                }
                to.clone()
            }
            [] => {
                return Err(GraphError::Validation(
                    "no entry edge: add an edge from Start".to_string(),
                ))
            }
            _ => {
                return Err(GraphError::Validation(
                    "Start must have exactly one outbound edge".to_string(),
                ))
            }
        };

        for (from, to) in &self.static_edges {
            if from != START {
                if from == END {
                    return Err(GraphError::Validation(
                        "End cannot be an edge source".to_string(),
                    ));
                }
                self.check_declared("edge source", from)?;
            }
            self.check_declared("edge target", to)?;
        }
        for edge in &self.conditional {
            self.check_declared("conditional source", &edge.source)?;
            if edge.source == END {
                return Err(GraphError::Validation(
                    "End cannot carry a conditional edge".to_string(),
                ));
            }
            for target in edge.path_map.values() {
                self.check_declared("conditional target", target)?;
            }
        }
        for (starts, to) in &self.joins {
            if starts.is_empty() {
                return Err(GraphError::Validation(
                    "join edge requires at least one start".to_string(),
                ));
            }
            if starts.contains(END) {
                // A barrier expecting End would never be fillable.
                return Err(GraphError::Validation(
                    "join edge cannot expect End as a contributor".to_string(),
                ));
            }
            for start in starts {
                self.check_declared("join start", start)?;
            }
            self.check_declared("join target", to)?;
            if to == END {
                return Err(GraphError::Validation(
                    "join edge cannot target End".to_string(),
                ));
            }
        }
        for (id, draft) in &self.drafts {
            for target in draft.ends_map.values() {
                self.check_declared(&format!("ends map of '{}'", id), target)?;
            }
        }

        let mut channels: HashMap<String, Channel> = HashMap::new();
        let mut triggers: HashMap<NodeId, BTreeSet<String>> = HashMap::new();
        let mut writers: HashMap<NodeId, BTreeSet<String>> = HashMap::new();
        let mut end_writers: HashSet<NodeId> = HashSet::new();

        // Every declared node can be targeted by an edge, a conditional
        // branch, or a dynamic goto through one branch channel.
        for id in self.drafts.keys() {
            channels.insert(branch_channel(id), Channel::last_value());
            triggers.entry(id.clone()).or_default().insert(branch_channel(id));
        }
        channels.insert(trigger_channel(&entry), Channel::last_value());
        triggers
            .entry(entry.clone())
            .or_default()
            .insert(trigger_channel(&entry));

        for (from, to) in &self.static_edges {
            if from == START {
                continue;
            }
            if to == END {
                end_writers.insert(from.clone());
            } else {
                writers
                    .entry(from.clone())
                    .or_default()
                    .insert(branch_channel(to));
            }
        }

        for (starts, to) in &self.joins {
            let name = join_channel(to, starts);
            channels.insert(name.clone(), Channel::barrier(starts.iter().cloned()));
            for start in starts {
                writers.entry(start.clone()).or_default().insert(name.clone());
            }
            triggers.entry(to.clone()).or_default().insert(name);
        }

        let mut conditional: HashMap<NodeId, Vec<ConditionalEdge>> = HashMap::new();
        for edge in self.conditional {
            conditional.entry(edge.source.clone()).or_default().push(edge);
        }

        let mut nodes: HashMap<NodeId, NodeSpec> = HashMap::new();
        for (id, draft) in self.drafts {
            let node_triggers = triggers.remove(&id).unwrap_or_default();
            let node_writers = writers.remove(&id).unwrap_or_default();
            nodes.insert(
                id.clone(),
                NodeSpec {
                    id,
                    kind: draft.kind,
                    function: draft.function,
                    triggers: node_triggers.into_iter().collect(),
                    writers: node_writers.into_iter().collect(),
                    retry_policy: draft.retry_policy,
                    interrupt_before: draft.interrupt_before,
                    interrupt_after: draft.interrupt_after,
                    ends_map: draft.ends_map,
                    cache_key: draft.cache_key,
                },
            );
        }

        let mut trigger_to_nodes: HashMap<String, Vec<NodeId>> = HashMap::new();
        for spec in nodes.values() {
            for trigger in &spec.triggers {
                trigger_to_nodes
                    .entry(trigger.clone())
                    .or_default()
                    .push(spec.id.clone());
            }
        }
        for subscribers in trigger_to_nodes.values_mut() {
            subscribers.sort();
        }

        Ok(CompiledGraph {
            schema: self.schema,
            nodes,
            entry,
            channels,
            conditional,
            end_writers,
            trigger_to_nodes,
        })
    }
}

/// The immutable compiled graph.
pub struct CompiledGraph {
    schema: StateSchema,
    nodes: HashMap<NodeId, NodeSpec>,
    entry: NodeId,
    channels: HashMap<String, Channel>,
    conditional: HashMap<NodeId, Vec<ConditionalEdge>>,
    end_writers: HashSet<NodeId>,
    trigger_to_nodes: HashMap<String, Vec<NodeId>>,
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("entry", &self.entry)
            .field("nodes", &self.nodes.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl CompiledGraph {
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &HashMap<NodeId, NodeSpec> {
        &self.nodes
    }

    /// Node ids in the stable (lexicographic) order used for tie-breaking.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn triggers_of(&self, id: &str) -> &[String] {
        self.nodes.get(id).map(|n| n.triggers.as_slice()).unwrap_or(&[])
    }

    pub fn writers_of(&self, id: &str) -> &[String] {
        self.nodes.get(id).map(|n| n.writers.as_slice()).unwrap_or(&[])
    }

    pub fn conditional_edges_of(&self, id: &str) -> &[ConditionalEdge] {
        self.conditional.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes with a static edge to End.
    pub fn writes_to_end(&self, id: &str) -> bool {
        self.end_writers.contains(id)
    }

    /// Fresh copy of the initial channel map.
    pub fn channels(&self) -> HashMap<String, Channel> {
        self.channels.clone()
    }

    pub fn trigger_to_nodes(&self) -> &HashMap<String, Vec<NodeId>> {
        &self.trigger_to_nodes
    }

    /// Resolve a branch key produced by a conditional or a `goto`.
    ///
    /// Resolution order: the edge's path map, the source node's ends map,
    /// then the key itself when it directly names a declared node or End.
    pub fn resolve_branch_key(
        &self,
        source: &str,
        key: &str,
        path_map: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        if let Some(target) = path_map.and_then(|m| m.get(key)) {
            return Ok(target.clone());
        }
        if let Some(target) = self.nodes.get(source).and_then(|n| n.ends_map.get(key)) {
            return Ok(target.clone());
        }
        if key == END || self.nodes.contains_key(key) {
            return Ok(key.to_string());
        }
        Err(GraphError::planning(source, key))
    }
}
