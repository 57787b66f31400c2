//! The checkpoint saver abstraction.
//!
//! [`CheckpointSaver`] is the storage interface the executor persists
//! through. A saver stores checkpoints keyed by `(lineage_id, namespace)`
//! and ordered by creation within that scope. Implementations must be
//! `Send + Sync`; puts may be asynchronous internally but a put must be
//! complete before the executor dispatches the following superstep.
//!
//! The crate ships [`crate::memory::InMemorySaver`] as the reference
//! implementation. Database-backed savers implement this trait downstream;
//! only the contract lives here.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::Result,
};
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Async stream of checkpoint tuples, newest first.
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Storage backend contract for checkpoint persistence.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch just the checkpoint for the given configuration.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|t| t.checkpoint))
    }

    /// Retrieve a checkpoint tuple.
    ///
    /// With a `checkpoint_id` the exact checkpoint is returned; otherwise
    /// the latest checkpoint under `(lineage_id, namespace)`. Returns
    /// `Ok(None)` (not an error) when nothing matches.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Retrieve the most recent checkpoint under `(lineage_id, namespace)`
    /// that recorded an interrupt. Used by resume when no explicit
    /// checkpoint id is supplied.
    async fn latest_interrupted(&self, config: &CheckpointConfig)
        -> Result<Option<CheckpointTuple>>;

    /// Query checkpoints, newest first, optionally filtered by metadata
    /// fields, bounded by a `before` cursor and a result limit.
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Store a checkpoint. Returns the config identifying the stored
    /// checkpoint (with its actual `checkpoint_id`).
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Attach pending writes to an existing checkpoint.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
    ) -> Result<()>;

    /// Delete every checkpoint (all namespaces) under a lineage.
    async fn delete_lineage(&self, lineage_id: &str) -> Result<()>;
}
