//! The batched triple writer.
//!
//! Triples are buffered up to a configured batch size; each flush encodes
//! one GraphCol chunk, uploads it on a background task, and folds the
//! batch's entities into both a per-chunk and the namespace-wide combined
//! bloom filter. Uploads overlap with further batching, bounded by
//! `max_pending_batches`; [BatchedTripleWriter::is_backpressured] is the
//! poll callers observe to yield, and [BatchedTripleWriter::finalize]
//! blocks until every upload has landed.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use object_store::{path::Path, ObjectStore};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use graphlake_graphcol::ident::Namespace;
use graphlake_graphcol::triple::Triple;
use graphlake_graphcol::value::Value;

use crate::bloom::{BloomFilter, CHUNK_FILTER_MAX_BYTES, COMBINED_FILTER_MAX_BYTES};
use crate::error::Error;
use crate::manifest::ChunkDescriptor;
use crate::path::{storage_path, ChunkId};
use crate::time::now_ms;

/// Smallest capacity a per-chunk filter is sized for, so tiny tail
/// batches don't get degenerate filters.
const MIN_CHUNK_FILTER_CAPACITY: u64 = 100;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct BatchWriterConfig {
    /// Triples per chunk.
    pub batch_size: usize,
    /// Uploads allowed in flight before the writer reports backpressure.
    pub max_pending_batches: usize,
    pub chunk_filter_fpr: f64,
    pub chunk_filter_max_bytes: usize,
    /// Expected total entities in the namespace; sizes the combined
    /// filter up-front so resumed jobs can merge into it.
    pub combined_capacity: u64,
    pub combined_fpr: f64,
    pub combined_max_bytes: usize,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            max_pending_batches: 2,
            chunk_filter_fpr: 0.01,
            chunk_filter_max_bytes: CHUNK_FILTER_MAX_BYTES,
            combined_capacity: 1_000_000,
            combined_fpr: 0.01,
            combined_max_bytes: COMBINED_FILTER_MAX_BYTES,
        }
    }
}

/// Serializable writer state, captured into checkpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterState {
    pub triples_written: u64,
    pub chunks_uploaded: u64,
    pub bytes_uploaded: u64,
    pub chunk_infos: Vec<ChunkDescriptor>,
    /// The combined bloom filter in its JSON form.
    pub bloom_state: serde_json::Value,
}

/// What a finished job hands to the manifest.
pub struct WriteSummary {
    pub total_triples: u64,
    pub total_chunks: u64,
    pub total_bytes: u64,
    pub chunks: Vec<ChunkDescriptor>,
    pub combined_bloom: BloomFilter,
}

pub struct BatchedTripleWriter {
    object_store: Arc<dyn ObjectStore>,
    namespace: Namespace,
    config: BatchWriterConfig,
    buffer: Vec<Triple>,
    combined: BloomFilter,
    chunks: Vec<ChunkDescriptor>,
    triples_written: u64,
    bytes_uploaded: u64,
    uploads: JoinSet<Result<(), Error>>,
    /// First upload failure; sticky, fails the job on the next call.
    failed: Option<String>,
}

impl BatchedTripleWriter {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        namespace: Namespace,
        config: BatchWriterConfig,
    ) -> Result<Self, Error> {
        let combined = BloomFilter::with_capacity(
            config.combined_capacity,
            config.combined_fpr,
            config.combined_max_bytes,
        )
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        Ok(Self {
            object_store,
            namespace,
            config,
            buffer: Vec::new(),
            combined,
            chunks: Vec::new(),
            triples_written: 0,
            bytes_uploaded: 0,
            uploads: JoinSet::new(),
            failed: None,
        })
    }

    /// Reconstructs a writer from a checkpointed [WriterState].
    pub fn restore(
        object_store: Arc<dyn ObjectStore>,
        namespace: Namespace,
        config: BatchWriterConfig,
        state: WriterState,
    ) -> Result<Self, Error> {
        let json = serde_json::from_value(state.bloom_state)?;
        let combined =
            BloomFilter::from_json(&json).map_err(|e| Error::InvalidRequest(e.to_string()))?;

        Ok(Self {
            object_store,
            namespace,
            config,
            buffer: Vec::new(),
            combined,
            chunks: state.chunk_infos,
            triples_written: state.triples_written,
            bytes_uploaded: state.bytes_uploaded,
            uploads: JoinSet::new(),
            failed: None,
        })
    }

    /// Buffers one triple, flushing when the batch size is reached. Only
    /// suspends when that flush has to wait for an upload slot.
    pub async fn add_triple(&mut self, triple: Triple) -> Result<(), Error> {
        self.buffer.push(triple);
        if self.buffer.len() >= self.config.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn add_triples(
        &mut self,
        triples: impl IntoIterator<Item = Triple>,
    ) -> Result<(), Error> {
        for triple in triples {
            self.add_triple(triple).await?;
        }
        Ok(())
    }

    /// True while `max_pending_batches` uploads are in flight. A poll,
    /// not a signal: callers yield between records while this holds.
    pub fn is_backpressured(&mut self) -> bool {
        self.reap_finished();
        self.uploads.len() >= self.config.max_pending_batches
    }

    /// Encodes and uploads the buffered triples as one chunk. Returns the
    /// chunk path, or [None] when the buffer was empty.
    #[instrument(skip_all, fields(namespace = %self.namespace, buffered = self.buffer.len()), err)]
    pub async fn flush(&mut self) -> Result<Option<Path>, Error> {
        self.check_failed()?;
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let batch = std::mem::take(&mut self.buffer);

        // Per-chunk filter, sized by the entities actually in the batch.
        let mut entities: HashSet<&str> = HashSet::new();
        for triple in &batch {
            entities.insert(triple.subject.as_str());
            match &triple.object {
                Value::Ref(url) => {
                    entities.insert(url.as_str());
                }
                Value::RefArray(urls) => {
                    entities.extend(urls.iter().map(|u| u.as_str()));
                }
                _ => {}
            }
        }
        let mut chunk_filter = BloomFilter::with_capacity(
            (entities.len() as u64).max(MIN_CHUNK_FILTER_CAPACITY),
            self.config.chunk_filter_fpr,
            self.config.chunk_filter_max_bytes,
        )
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        for entity in &entities {
            chunk_filter.add(entity);
            self.combined.add(entity);
        }

        let encoded = Bytes::from(graphlake_graphcol::codec::encode(&batch, &self.namespace)?);
        let chunk_id = ChunkId::generate(now_ms());
        let path = storage_path(&self.namespace, &chunk_id);

        self.chunks.push(ChunkDescriptor {
            id: chunk_id.to_string(),
            path: path.to_string(),
            triple_count: batch.len() as u64,
            min_time: batch.iter().map(|t| t.timestamp).min().unwrap_or(0),
            max_time: batch.iter().map(|t| t.timestamp).max().unwrap_or(0),
            bytes: encoded.len() as u64,
            bloom: Some(serde_json::to_value(chunk_filter.to_json())?),
        });
        self.triples_written += batch.len() as u64;
        self.bytes_uploaded += encoded.len() as u64;

        // Take an upload slot, waiting for one when the limit is reached.
        self.reap_finished();
        while self.uploads.len() >= self.config.max_pending_batches {
            if let Some(result) = self.uploads.join_next().await {
                self.record_upload_result(result);
            }
        }
        self.check_failed()?;

        debug!(chunk.id = %chunk_id, chunk.path = %path, chunk.bytes = encoded.len(), "uploading chunk");
        let object_store = self.object_store.clone();
        let upload_path = path.clone();
        self.uploads
            .spawn(async move { upload_chunk(object_store, upload_path, encoded).await });

        Ok(Some(path))
    }

    /// Flushes the tail batch, waits for every upload, and returns the
    /// summary the manifest is built from.
    #[instrument(skip_all, fields(namespace = %self.namespace), err)]
    pub async fn finalize(mut self) -> Result<WriteSummary, Error> {
        self.flush().await?;
        while let Some(result) = self.uploads.join_next().await {
            self.record_upload_result(result);
        }
        self.check_failed()?;

        Ok(WriteSummary {
            total_triples: self.triples_written,
            total_chunks: self.chunks.len() as u64,
            total_bytes: self.bytes_uploaded,
            chunks: self.chunks,
            combined_bloom: self.combined,
        })
    }

    /// Captures the writer state for a checkpoint.
    ///
    /// Requires a flushed buffer and waits for in-flight uploads, so the
    /// state never references a chunk that isn't durable yet.
    pub async fn snapshot(&mut self) -> Result<WriterState, Error> {
        if !self.buffer.is_empty() {
            return Err(Error::InvalidRequest(
                "snapshot requires a flushed buffer".to_string(),
            ));
        }
        while let Some(result) = self.uploads.join_next().await {
            self.record_upload_result(result);
        }
        self.check_failed()?;

        Ok(WriterState {
            triples_written: self.triples_written,
            chunks_uploaded: self.chunks.len() as u64,
            bytes_uploaded: self.bytes_uploaded,
            chunk_infos: self.chunks.clone(),
            bloom_state: serde_json::to_value(self.combined.to_json())?,
        })
    }

    pub fn triples_written(&self) -> u64 {
        self.triples_written
    }

    pub fn chunks_uploaded(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    pub fn combined_bloom(&self) -> &BloomFilter {
        &self.combined
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.uploads.try_join_next() {
            self.record_upload_result(result);
        }
    }

    fn record_upload_result(&mut self, result: Result<Result<(), Error>, tokio::task::JoinError>) {
        let outcome = match result {
            Ok(inner) => inner,
            Err(join_error) => Err(join_error.into()),
        };
        if let Err(e) = outcome {
            warn!(err = %e, "chunk upload failed");
            if self.failed.is_none() {
                self.failed = Some(e.to_string());
            }
        }
    }

    fn check_failed(&self) -> Result<(), Error> {
        match &self.failed {
            Some(message) => Err(Error::StorageError(message.clone())),
            None => Ok(()),
        }
    }
}

/// Uploads one chunk, retrying once before giving up.
async fn upload_chunk(
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    data: Bytes,
) -> Result<(), Error> {
    if let Err(first) = object_store.put(&path, data.clone().into()).await {
        warn!(chunk.path = %path, err = %first, "chunk upload failed, retrying once");
        object_store.put(&path, data.into()).await.map_err(|e| {
            Error::StorageError(format!("chunk upload failed after retry: {}", e))
        })?;
    }
    Ok(())
}
