//! Resumable import state.
//!
//! A checkpoint is the single source of truth for resuming a job: where
//! in the source byte stream to continue, how to restore the line reader
//! and the batched writer, and the running counters. It lives in the
//! durable key-value store under `checkpoint:{job_id}`; deleting it marks
//! the job as successfully finished.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Error;
use crate::kv::KvStore;
use crate::time::now_ms;

const KEY_PREFIX: &str = "checkpoint:";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCheckpoint {
    pub job_id: String,
    pub source_url: String,
    /// First source byte not yet fully processed. Monotonically
    /// non-decreasing within a job.
    pub byte_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub lines_processed: u64,
    pub triples_written: u64,
    /// Opaque state blob of the streaming line reader.
    pub line_reader_state: serde_json::Value,
    /// Opaque state blob of the batched triple writer.
    pub batch_writer_state: serde_json::Value,
    /// Stamped on every save, milliseconds since epoch.
    pub checkpointed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ImportCheckpoint {
    fn key(job_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, job_id)
    }
}

/// Checkpoint persistence over a [KvStore].
#[derive(Clone)]
pub struct CheckpointStore {
    kv: Arc<dyn KvStore>,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    #[instrument(level = "debug", skip_all, fields(job_id))]
    pub async fn load(&self, job_id: &str) -> Result<Option<ImportCheckpoint>, Error> {
        match self.kv.get(&ImportCheckpoint::key(job_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Persists `checkpoint`, stamping `checkpointed_at`.
    ///
    /// A checkpoint whose `byte_offset` went backwards relative to the
    /// stored one is rejected: the offset only ever moves forward within
    /// a job.
    #[instrument(level = "debug", skip_all, fields(job_id = %checkpoint.job_id, byte_offset = checkpoint.byte_offset))]
    pub async fn save(&self, checkpoint: &ImportCheckpoint) -> Result<(), Error> {
        if let Some(existing) = self.load(&checkpoint.job_id).await? {
            if checkpoint.byte_offset < existing.byte_offset {
                return Err(Error::InvalidRequest(format!(
                    "byte offset moved backwards: {} < {}",
                    checkpoint.byte_offset, existing.byte_offset
                )));
            }
        }

        let mut stamped = checkpoint.clone();
        stamped.checkpointed_at = now_ms();
        self.kv
            .put(
                &ImportCheckpoint::key(&checkpoint.job_id),
                serde_json::to_value(&stamped)?,
            )
            .await
    }

    /// Read-merge-write: applies `apply` to the stored checkpoint and
    /// saves the result.
    pub async fn update(
        &self,
        job_id: &str,
        apply: impl FnOnce(&mut ImportCheckpoint),
    ) -> Result<ImportCheckpoint, Error> {
        let mut checkpoint = self
            .load(job_id)
            .await?
            .ok_or_else(|| Error::InvalidRequest(format!("no checkpoint for job {:?}", job_id)))?;
        apply(&mut checkpoint);
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Removes the checkpoint; this is how success is recorded.
    #[instrument(level = "debug", skip_all, fields(job_id))]
    pub async fn delete(&self, job_id: &str) -> Result<(), Error> {
        self.kv.delete(&ImportCheckpoint::key(job_id)).await
    }

    /// All persisted checkpoints, across jobs.
    pub async fn list(&self) -> Result<Vec<ImportCheckpoint>, Error> {
        self.kv
            .list(KEY_PREFIX)
            .await?
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).map_err(Error::from))
            .collect()
    }
}
