//! In-memory checkpoint saver.
//!
//! Reference implementation of [`CheckpointSaver`] backed by a
//! `tokio::sync::RwLock`-guarded map. Suitable for tests, development and
//! single-process runs; nothing survives a restart. Storage is keyed by
//! `(lineage_id, namespace)` so a subgraph's flow never collides with its
//! parent's.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::{CheckpointError, Result},
    traits::{CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CheckpointEntry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    config: CheckpointConfig,
    parent_config: Option<CheckpointConfig>,
}

impl CheckpointEntry {
    fn tuple(&self) -> CheckpointTuple {
        CheckpointTuple {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            metadata: self.metadata.clone(),
            parent_config: self.parent_config.clone(),
        }
    }
}

type Storage = Arc<RwLock<HashMap<(String, String), Vec<CheckpointEntry>>>>;

/// In-memory [`CheckpointSaver`] implementation.
///
/// Cloning shares the underlying storage, so a saver handed to several
/// executors (e.g. a parent and its subgraphs) observes one store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySaver {
    storage: Storage,
}

impl InMemorySaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `(lineage, namespace)` flows being tracked.
    pub async fn flow_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total number of checkpoints across all flows.
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.values().map(Vec::len).sum()
    }

    /// Drop everything. Useful between tests.
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    fn key_of(config: &CheckpointConfig) -> Result<(String, String)> {
        let lineage = config
            .lineage_id
            .clone()
            .ok_or_else(|| CheckpointError::Invalid("lineage_id is required".to_string()))?;
        Ok((lineage, config.namespace().to_string()))
    }
}

#[async_trait]
impl CheckpointSaver for InMemorySaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let key = Self::key_of(config)?;
        let storage = self.storage.read().await;

        let Some(entries) = storage.get(&key) else {
            return Ok(None);
        };

        if let Some(checkpoint_id) = &config.checkpoint_id {
            Ok(entries
                .iter()
                .find(|e| &e.checkpoint.id == checkpoint_id)
                .map(CheckpointEntry::tuple))
        } else {
            Ok(entries.last().map(CheckpointEntry::tuple))
        }
    }

    async fn latest_interrupted(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>> {
        let key = Self::key_of(config)?;
        let storage = self.storage.read().await;

        Ok(storage.get(&key).and_then(|entries| {
            entries
                .iter()
                .rev()
                .find(|e| e.checkpoint.is_interrupted())
                .map(CheckpointEntry::tuple)
        }))
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;

        let keys: Vec<(String, String)> = match config {
            Some(cfg) if cfg.lineage_id.is_some() => vec![Self::key_of(cfg)?],
            _ => storage.keys().cloned().collect(),
        };

        let mut results = Vec::new();
        'outer: for key in keys {
            let Some(entries) = storage.get(&key) else {
                continue;
            };
            // Cursor semantics: only entries created before `before` qualify.
            let before_idx = before
                .and_then(|b| b.checkpoint_id.as_ref())
                .and_then(|id| entries.iter().position(|e| &e.checkpoint.id == id));

            let upto = before_idx.unwrap_or(entries.len());
            for entry in entries[..upto].iter().rev() {
                if let Some(filter_map) = &filter {
                    let matches = filter_map
                        .iter()
                        .all(|(k, v)| entry.metadata.extra.get(k) == Some(v));
                    if !matches {
                        continue;
                    }
                }

                results.push(Ok(entry.tuple()));
                if limit.is_some_and(|lim| results.len() >= lim) {
                    break 'outer;
                }
            }
        }

        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let key = Self::key_of(config)?;
        let mut storage = self.storage.write().await;
        let entries = storage.entry(key.clone()).or_default();

        let stored_config = CheckpointConfig {
            lineage_id: Some(key.0.clone()),
            checkpoint_id: Some(checkpoint.id.clone()),
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: config.extra.clone(),
        };

        let parent_config = entries.last().map(|prev| CheckpointConfig {
            lineage_id: Some(key.0.clone()),
            checkpoint_id: Some(prev.checkpoint.id.clone()),
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: HashMap::new(),
        });

        entries.push(CheckpointEntry {
            checkpoint,
            metadata,
            config: stored_config.clone(),
            parent_config,
        });

        Ok(stored_config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        let key = Self::key_of(config)?;
        let checkpoint_id = config
            .checkpoint_id
            .as_ref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&key)
            .and_then(|entries| {
                entries
                    .iter_mut()
                    .find(|e| &e.checkpoint.id == checkpoint_id)
            })
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        entry.checkpoint.pending_writes.extend(writes);
        Ok(())
    }

    async fn delete_lineage(&self, lineage_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.retain(|(lineage, _), _| lineage != lineage_id);
        Ok(())
    }
}
