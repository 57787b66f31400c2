//! # agentgraph-checkpoint - channels and state persistence
//!
//! Channel cells and checkpoint abstractions for the agentgraph execution
//! engine. This crate carries no execution logic: it defines the versioned
//! communication cells the executor schedules over ([`Channel`]), the
//! snapshot format persisted at superstep boundaries ([`Checkpoint`]), and
//! the storage contract behind which any backend can sit
//! ([`CheckpointSaver`]).
//!
//! ## Checkpoints
//!
//! A checkpoint captures, for one `(lineage_id, namespace)` flow:
//!
//! - per-channel value snapshots and monotonic versions,
//! - per-node high-water-marks (`versions_seen`) so resumed consumers do
//!   not re-observe channels they already processed,
//! - writes pending at interrupt time, replayed on resume,
//! - the interrupt record itself, when the run suspended.
//!
//! Lineages group the checkpoints of one logical run family; namespaces
//! isolate sub-flows (a subgraph checkpoints under its parent node id).
//!
//! ## Storage backends
//!
//! [`InMemorySaver`] is the reference implementation used by tests and
//! single-process runs. Durable backends implement [`CheckpointSaver`]
//! downstream; the executor only sees the trait.
//!
//! ```rust
//! use agentgraph_checkpoint::{
//!     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, InMemorySaver,
//! };
//! use std::collections::HashMap;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let saver = InMemorySaver::new();
//! let config = CheckpointConfig::new().with_lineage_id("run-1");
//!
//! let stored = saver
//!     .put(&config, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
//!     .await?;
//! assert!(saver.get_tuple(&stored).await?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use channels::{Channel, ChannelVersion};
pub use checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointTuple, IncludeContents, PendingWrite,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemorySaver;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use traits::{CheckpointSaver, CheckpointStream};
