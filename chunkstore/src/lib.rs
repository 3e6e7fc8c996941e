//! Chunk storage for the graphlake core.
//!
//! Sits between the [graphlake_graphcol] data model and an object store:
//! the batched writer turns streams of triples into immutable GraphCol
//! chunks at reversed-host paths, bloom filters index chunk membership,
//! the manifest publishes a namespace's chunk list, and checkpoints keep
//! import jobs resumable through a durable key-value store.

pub mod bloom;
pub mod checkpoint;
pub mod error;
pub mod hash;
pub mod kv;
pub mod manifest;
pub mod path;
pub mod router;
mod time;
pub mod writer;

pub use bloom::{BloomFilter, Membership};
pub use checkpoint::{CheckpointStore, ImportCheckpoint};
pub use error::Error;
pub use kv::{KvStore, MemoryKvStore, RedbKvStore};
pub use manifest::{ChunkDescriptor, ChunkManifest, ManifestStats};
pub use path::{manifest_path, storage_path, ChunkId};
pub use router::ChunkRouter;
pub use writer::{BatchWriterConfig, BatchedTripleWriter, WriteSummary, WriterState};
