//! Administrative access to a checkpoint store.

use crate::error::Result;
use agentgraph_checkpoint::{CheckpointConfig, CheckpointSaver, CheckpointTuple};
use futures::StreamExt;
use std::sync::Arc;

/// Thin administrative wrapper over a [`CheckpointSaver`].
#[derive(Clone)]
pub struct CheckpointManager {
    saver: Arc<dyn CheckpointSaver>,
}

impl CheckpointManager {
    pub fn new(saver: Arc<dyn CheckpointSaver>) -> Self {
        Self { saver }
    }

    /// List checkpoints under a config, newest first.
    pub async fn list_checkpoints(
        &self,
        config: &CheckpointConfig,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let mut stream = self.saver.list(Some(config), None, None, limit).await?;
        let mut tuples = Vec::new();
        while let Some(tuple) = stream.next().await {
            tuples.push(tuple?);
        }
        Ok(tuples)
    }

    /// Fetch one checkpoint (latest under the config when no id is set).
    pub async fn get_checkpoint(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>> {
        Ok(self.saver.get_tuple(config).await?)
    }

    /// Delete every checkpoint of a lineage, across all namespaces.
    pub async fn delete_lineage(&self, lineage_id: &str) -> Result<()> {
        Ok(self.saver.delete_lineage(lineage_id).await?)
    }
}
