//! Checkpoint data structures.
//!
//! A checkpoint is a durable snapshot of a run at a superstep boundary:
//! channel value snapshots, channel versions, per-node high-water-marks
//! (`versions_seen`), any writes that were pending when an interrupt fired,
//! and the interrupt record itself. Checkpoints are scoped by
//! `(lineage_id, namespace)` and ordered within that scope by creation; a
//! subgraph isolates its own flow by running under its parent node's
//! namespace.
//!
//! `versions_seen` is persisted so that a resumed run's consumers restart
//! from their recorded high-water-marks instead of re-observing channels
//! they already processed.

use crate::channels::ChannelVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Pending write tuple: (task_id, channel, value)
///
/// A write produced by a completed task that had not yet been applied when
/// the checkpoint was taken. Replayed on resume before planning.
pub type PendingWrite = (String, String, serde_json::Value);

/// Mapping from channel name to version
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// Origin of a checkpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Snapshot of the initial input (step 0)
    Input,
    /// Snapshot taken at a superstep boundary
    Loop,
    /// Snapshot taken when the run suspended on an interrupt
    Interrupt,
}

/// How much channel value content is persisted with a checkpoint
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IncludeContents {
    /// Persist no channel values, only versions and bookkeeping
    None,
    /// Persist values, dropping entries that do not serialize to JSON
    #[default]
    Filtered,
    /// Persist all channel values verbatim
    All,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The superstep number of the checkpoint.
    /// -1 for the initial "input" checkpoint, n for step n afterwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Number of writes applied in the step that produced this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes_count: Option<usize>,

    /// Wall-clock duration of the step, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Serialized size of the channel values, in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_writes_count(mut self, count: usize) -> Self {
        self.writes_count = Some(count);
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn with_extra(mut self, key: String, value: serde_json::Value) -> Self {
        self.extra.insert(key, value);
        self
    }
}

/// State snapshot at a superstep boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version (currently 1)
    pub v: i32,

    /// Unique checkpoint id
    pub id: CheckpointId,

    /// Creation timestamp
    pub ts: DateTime<Utc>,

    /// Channel name → serialized channel snapshot
    pub channel_values: HashMap<String, serde_json::Value>,

    /// Channel name → version at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Node id → channel name → version last observed by that node.
    /// Determines which nodes trigger after a restore.
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// Writes recorded but not yet applied when the checkpoint was taken.
    /// Empty for loop/input checkpoints; populated for interrupt checkpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_writes: Vec<PendingWrite>,

    /// Serialized interrupt record, present on interrupt checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_state: Option<serde_json::Value>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    pub fn new(
        id: CheckpointId,
        channel_values: HashMap<String, serde_json::Value>,
        channel_versions: ChannelVersions,
        versions_seen: HashMap<String, ChannelVersions>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id,
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            pending_writes: Vec::new(),
            interrupt_state: None,
        }
    }

    /// Create an empty checkpoint with a fresh id.
    pub fn empty() -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
    }

    pub fn with_pending_writes(mut self, writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = writes;
        self
    }

    pub fn with_interrupt_state(mut self, state: serde_json::Value) -> Self {
        self.interrupt_state = Some(state);
        self
    }

    /// Whether this checkpoint was taken while suspended on an interrupt.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt_state.is_some()
    }
}

/// Configuration identifying a checkpoint flow and optionally one checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointConfig {
    /// Lineage id grouping the checkpoints of one logical run family.
    /// Required for any persistence to happen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineage_id: Option<String>,

    /// Specific checkpoint id to retrieve (latest when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Namespace isolating sub-flows within a lineage (subgraphs default
    /// their namespace to the parent node id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    /// Additional configuration
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lineage_id(mut self, lineage_id: impl Into<String>) -> Self {
        self.lineage_id = Some(lineage_id.into());
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    /// The namespace, defaulting to the root (empty) namespace.
    pub fn namespace(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }
}

/// A checkpoint together with its config, metadata, and parent link
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent_config: Option<CheckpointConfig>,
}

impl CheckpointTuple {
    pub fn new(
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
        }
    }

    pub fn with_parent_config(mut self, parent_config: CheckpointConfig) -> Self {
        self.parent_config = Some(parent_config);
        self
    }
}
