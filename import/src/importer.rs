//! The streaming import orchestrator.
//!
//! Composes the range fetcher, the line reader, the record parser, a
//! caller-supplied transform and the batched triple writer into one
//! resumable job: `fetch → decompress? → split lines → parse →
//! transform → write chunks → checkpoint`. The checkpoint in the durable
//! key-value store is the single source of truth; a restarted process
//! picks up at the last window boundary and produces the same manifest an
//! uninterrupted run would have (chunk partitioning aside).
//!
//! Gzipped sources cannot be combined with range requests: gzip members
//! don't align with byte windows, so a window-by-window inflate cannot be
//! resumed safely. Such sources stream from offset zero instead (with
//! multi-member decoding) and resume by skipping the checkpointed number
//! of lines.

use std::pin::Pin;
use std::sync::Arc;

use async_compression::tokio::bufread::GzipDecoder;
use object_store::ObjectStore;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};

use graphlake_chunkstore::checkpoint::{CheckpointStore, ImportCheckpoint};
use graphlake_chunkstore::kv::KvStore;
use graphlake_chunkstore::manifest::ChunkManifest;
use graphlake_chunkstore::writer::{BatchWriterConfig, BatchedTripleWriter};
use graphlake_graphcol::ident::Namespace;
use graphlake_graphcol::triple::Triple;
use graphlake_graphcol::ulid::{Ulid, UlidGenerator};

use crate::error::ImportError;
use crate::fetcher::{FetchError, HttpClient, RangeFetcher, RangeFetcherConfig};
use crate::line_reader::{LineReaderState, StreamingLineReader, DEFAULT_MAX_BUFFER_SIZE};
use crate::record::{parse_line, Record, RecordFormat};

/// Turns one source record into triples, all sharing the job's
/// transaction id.
pub type Transform = Arc<
    dyn Fn(Record, &Ulid) -> Result<Vec<Triple>, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

fn default_checkpoint_every() -> u64 {
    50_000
}

fn default_use_range_requests() -> bool {
    true
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ImportConfig {
    pub source_url: String,
    pub format: RecordFormat,
    /// Namespace URL all imported subjects live under; also determines
    /// the job id and the chunk paths.
    pub namespace: String,
    #[serde(default)]
    pub gzipped: bool,
    #[serde(default = "default_use_range_requests")]
    pub use_range_requests: bool,
    /// In whole-stream mode, checkpoint every this many lines.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default)]
    pub fetcher: RangeFetcherConfig,
    #[serde(default)]
    pub writer: BatchWriterConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Idle,
    Loading,
    Completed,
    Error,
}

/// What an observer of the job sees.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub bytes_processed: u64,
    pub lines_processed: u64,
    pub triples_written: u64,
    pub chunks_uploaded: u64,
    pub bytes_uploaded: u64,
    pub errors: u64,
    /// Present while `state` is [JobState::Error].
    pub message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ImportSummary {
    pub job_id: String,
    pub manifest_path: String,
    pub manifest: ChunkManifest,
    pub lines_processed: u64,
    pub triples_written: u64,
    pub chunks_uploaded: u64,
    pub bytes_uploaded: u64,
    pub errors: u64,
}

/// Result of processing one window.
pub enum StepOutcome {
    /// More windows remain; call again.
    More,
    Finished(ImportSummary),
}

/// Live state of a job between windows.
struct JobContext {
    reader: StreamingLineReader,
    writer: BatchedTripleWriter,
    tx_id: Ulid,
    /// First byte of the next window.
    next_offset: u64,
    total_bytes: Option<u64>,
    lines_processed: u64,
    errors: u64,
    /// Lines to silently skip on a whole-stream resume; they were
    /// written before the checkpoint.
    skip_lines: u64,
}

pub struct StreamingImporter {
    config: ImportConfig,
    namespace: Namespace,
    job_id: String,
    transform: Transform,
    object_store: Arc<dyn ObjectStore>,
    checkpoints: CheckpointStore,
    http: Arc<dyn HttpClient>,
    fetcher: RangeFetcher,
    ulids: UlidGenerator,
    state: JobState,
    status: JobStatus,
    job: Option<JobContext>,
}

/// A job is identified by its namespace: host plus path segments.
fn derive_job_id(namespace: &Namespace) -> String {
    let mut parts = vec![namespace.host()];
    parts.extend(namespace.path_segments());
    parts.join("-")
}

impl StreamingImporter {
    pub fn new(
        config: ImportConfig,
        transform: Transform,
        object_store: Arc<dyn ObjectStore>,
        kv: Arc<dyn KvStore>,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self, ImportError> {
        if config.gzipped && config.use_range_requests {
            return Err(ImportError::Config(
                "range requests cannot be combined with a gzipped source; \
                 gzip members do not align with byte windows"
                    .to_string(),
            ));
        }
        if config.checkpoint_every == 0 {
            return Err(ImportError::Config(
                "checkpointEvery must be at least 1".to_string(),
            ));
        }
        let namespace = Namespace::parse(&config.namespace)
            .map_err(|e| ImportError::Config(format!("invalid namespace: {}", e)))?;
        let job_id = derive_job_id(&namespace);
        let fetcher = RangeFetcher::new(http.clone(), config.fetcher.clone());

        Ok(Self {
            config,
            namespace,
            job_id,
            transform,
            object_store,
            checkpoints: CheckpointStore::new(kv),
            http,
            fetcher,
            ulids: UlidGenerator::new(),
            state: JobState::Idle,
            status: JobStatus::default(),
            job: None,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status.clone()
    }

    /// Back to [JobState::Idle], dropping all in-memory buffers. The
    /// durable checkpoint is untouched.
    pub fn reset(&mut self) {
        self.job = None;
        self.state = JobState::Idle;
        self.status = JobStatus::default();
    }

    /// Runs the job to completion, resuming from a checkpoint when one
    /// exists. Re-running after an error clears it and continues.
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub async fn run(&mut self) -> Result<ImportSummary, ImportError> {
        self.begin()?;
        let result = if self.config.use_range_requests {
            loop {
                match self.step_inner().await {
                    Ok(StepOutcome::More) => continue,
                    Ok(StepOutcome::Finished(summary)) => break Ok(summary),
                    Err(e) => break Err(e),
                }
            }
        } else {
            self.run_stream().await
        };
        match result {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.record_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Processes exactly one window, checkpoints, and returns. The
    /// time-boxed entry point: an external driver calls this until its
    /// deadline and lets the checkpoint carry the job across calls.
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub async fn step(&mut self) -> Result<StepOutcome, ImportError> {
        if !self.config.use_range_requests {
            return Err(ImportError::InvariantViolation(
                "single-window stepping requires range requests".to_string(),
            ));
        }
        self.begin()?;
        match self.step_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&e).await;
                Err(e)
            }
        }
    }

    fn begin(&mut self) -> Result<(), ImportError> {
        if self.state == JobState::Completed {
            return Err(ImportError::InvariantViolation(
                "job already completed; reset before reuse".to_string(),
            ));
        }
        self.state = JobState::Loading;
        self.status.state = JobState::Loading;
        self.status.message = None;
        Ok(())
    }

    async fn step_inner(&mut self) -> Result<StepOutcome, ImportError> {
        self.init_job().await?;
        let next_offset = self.job.as_ref().expect("job initialized").next_offset;

        let window = self
            .fetcher
            .fetch_window(&self.config.source_url, next_offset)
            .await?;

        let Some(window) = window else {
            return Ok(StepOutcome::Finished(self.finish().await?));
        };

        let is_last = window.is_last;
        {
            let ctx = self.job.as_mut().expect("job initialized");
            let lines = ctx.reader.process_chunk(&window.data);
            process_lines(ctx, &self.transform, self.config.format, lines).await?;
            ctx.next_offset = window.end + 1;
            ctx.total_bytes = window.total_size;
            persist_checkpoint(
                ctx,
                &self.checkpoints,
                &self.job_id,
                &self.config.source_url,
            )
            .await?;
        }
        self.refresh_status();

        if is_last {
            Ok(StepOutcome::Finished(self.finish().await?))
        } else {
            Ok(StepOutcome::More)
        }
    }

    /// Whole-stream mode: one GET, optionally gunzipped, checkpointed on
    /// line-count boundaries.
    async fn run_stream(&mut self) -> Result<ImportSummary, ImportError> {
        self.init_job().await?;

        let resp = self
            .http
            .get(&self.config.source_url, None)
            .await
            .map_err(|e| FetchError::Exhausted(e.to_string()))?;
        if resp.status != 200 {
            return Err(FetchError::Fatal {
                status: resp.status,
            }
            .into());
        }

        let stream_reader = StreamReader::new(resp.body);
        let mut source: Pin<Box<dyn AsyncRead + Send>> = if self.config.gzipped {
            let mut decoder = GzipDecoder::new(stream_reader);
            decoder.multiple_members(true);
            Box::pin(decoder)
        } else {
            Box::pin(stream_reader)
        };

        let mut last_checkpoint_lines =
            self.job.as_ref().expect("job initialized").lines_processed;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            {
                let ctx = self.job.as_mut().expect("job initialized");
                let lines = ctx.reader.process_chunk(&buf[..n]);
                process_lines(ctx, &self.transform, self.config.format, lines).await?;
                if ctx.lines_processed - last_checkpoint_lines >= self.config.checkpoint_every {
                    persist_checkpoint(
                        ctx,
                        &self.checkpoints,
                        &self.job_id,
                        &self.config.source_url,
                    )
                    .await?;
                    last_checkpoint_lines = ctx.lines_processed;
                }
            }
            self.refresh_status();
        }

        self.finish().await
    }

    /// Builds the in-memory job context, restoring from the durable
    /// checkpoint when one exists.
    async fn init_job(&mut self) -> Result<(), ImportError> {
        if self.job.is_some() {
            return Ok(());
        }

        let checkpoint = self
            .checkpoints
            .load(&self.job_id)
            .await
            .map_err(|e| ImportError::Checkpoint(e.to_string()))?;
        let ranged = self.config.use_range_requests;

        let ctx = match checkpoint {
            Some(cp) => {
                debug!(
                    byte_offset = cp.byte_offset,
                    lines_processed = cp.lines_processed,
                    "resuming from checkpoint"
                );
                let writer = if cp.batch_writer_state.is_null() {
                    self.fresh_writer()?
                } else {
                    BatchedTripleWriter::restore(
                        self.object_store.clone(),
                        self.namespace.clone(),
                        self.config.writer.clone(),
                        serde_json::from_value(cp.batch_writer_state.clone())?,
                    )?
                };
                // In whole-stream mode the source is re-read from the
                // start, so the reader starts fresh and already-written
                // lines are skipped by count.
                let reader = if ranged && !cp.line_reader_state.is_null() {
                    let state: LineReaderState =
                        serde_json::from_value(cp.line_reader_state.clone())?;
                    StreamingLineReader::restore(self.config.max_line_bytes, state)
                } else {
                    StreamingLineReader::new(self.config.max_line_bytes)
                };
                let tx_id = cp
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("txId"))
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| self.ulids.generate());
                JobContext {
                    reader,
                    writer,
                    tx_id,
                    next_offset: cp.byte_offset,
                    total_bytes: cp.total_bytes,
                    lines_processed: cp.lines_processed,
                    errors: 0,
                    skip_lines: if ranged { 0 } else { cp.lines_processed },
                }
            }
            None => JobContext {
                reader: StreamingLineReader::new(self.config.max_line_bytes),
                writer: self.fresh_writer()?,
                tx_id: self.ulids.generate(),
                next_offset: 0,
                total_bytes: None,
                lines_processed: 0,
                errors: 0,
                skip_lines: 0,
            },
        };

        self.job = Some(ctx);
        Ok(())
    }

    fn fresh_writer(&self) -> Result<BatchedTripleWriter, ImportError> {
        Ok(BatchedTripleWriter::new(
            self.object_store.clone(),
            self.namespace.clone(),
            self.config.writer.clone(),
        )?)
    }

    /// Flushes everything, publishes the manifest, and deletes the
    /// checkpoint.
    async fn finish(&mut self) -> Result<ImportSummary, ImportError> {
        let mut ctx = self.job.take().expect("job initialized");

        if let Some(line) = ctx.reader.flush() {
            process_lines(&mut ctx, &self.transform, self.config.format, vec![line]).await?;
        }

        let lines_processed = ctx.lines_processed;
        let errors = ctx.errors;
        let bytes_processed = ctx.reader.bytes_processed();
        let summary = ctx.writer.finalize().await?;
        let combined = serde_json::to_value(summary.combined_bloom.to_json())?;
        let manifest = ChunkManifest::new(&self.namespace, summary.chunks, Some(combined));
        let manifest_path = manifest
            .write_to(&self.object_store, &self.namespace)
            .await?;
        self.checkpoints
            .delete(&self.job_id)
            .await
            .map_err(|e| ImportError::Checkpoint(e.to_string()))?;

        self.state = JobState::Completed;
        self.status = JobStatus {
            state: JobState::Completed,
            bytes_processed,
            lines_processed,
            triples_written: manifest.stats.total_triples,
            chunks_uploaded: manifest.stats.total_chunks,
            bytes_uploaded: manifest.stats.total_bytes,
            errors,
            message: None,
        };
        info!(
            lines_processed,
            triples_written = manifest.stats.total_triples,
            chunks_uploaded = manifest.stats.total_chunks,
            errors,
            manifest_path = %manifest_path,
            "import completed"
        );

        Ok(ImportSummary {
            job_id: self.job_id.clone(),
            manifest_path: manifest_path.to_string(),
            triples_written: manifest.stats.total_triples,
            chunks_uploaded: manifest.stats.total_chunks,
            bytes_uploaded: manifest.stats.total_bytes,
            manifest,
            lines_processed,
            errors,
        })
    }

    fn refresh_status(&mut self) {
        if let Some(ctx) = &self.job {
            self.status.bytes_processed = ctx.reader.bytes_processed();
            self.status.lines_processed = ctx.lines_processed;
            self.status.triples_written = ctx.writer.triples_written();
            self.status.chunks_uploaded = ctx.writer.chunks_uploaded();
            self.status.bytes_uploaded = ctx.writer.bytes_uploaded();
            self.status.errors = ctx.errors;
        }
    }

    /// Every failure path ends here: the job flips to the error state
    /// and a terminal checkpoint records the message, so `run` can be
    /// called again to resume.
    async fn record_failure(&mut self, error: &ImportError) {
        warn!(err = %error, "import failed");
        self.refresh_status();
        self.job = None;
        self.state = JobState::Error;
        self.status.state = JobState::Error;
        self.status.message = Some(error.to_string());

        let message = error.to_string();
        let result = match self.checkpoints.load(&self.job_id).await {
            Ok(Some(_)) => self
                .checkpoints
                .update(&self.job_id, |cp| {
                    let mut metadata = cp.metadata.take().unwrap_or_else(|| json!({}));
                    metadata["error"] = json!(message);
                    cp.metadata = Some(metadata);
                })
                .await
                .map(|_| ()),
            Ok(None) => {
                // Failed before the first checkpoint: record that the
                // job exists and why it stopped.
                self.checkpoints
                    .save(&ImportCheckpoint {
                        job_id: self.job_id.clone(),
                        source_url: self.config.source_url.clone(),
                        byte_offset: 0,
                        total_bytes: None,
                        lines_processed: 0,
                        triples_written: 0,
                        line_reader_state: serde_json::Value::Null,
                        batch_writer_state: serde_json::Value::Null,
                        checkpointed_at: 0,
                        metadata: Some(json!({ "error": message })),
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(err = %e, "failed to persist terminal checkpoint");
        }
    }
}

/// Parses, transforms and writes a batch of lines. Malformed lines and
/// failing transforms are counted and skipped; write failures abort.
async fn process_lines(
    ctx: &mut JobContext,
    transform: &Transform,
    format: RecordFormat,
    lines: Vec<String>,
) -> Result<(), ImportError> {
    for line in lines {
        if ctx.skip_lines > 0 {
            ctx.skip_lines -= 1;
            continue;
        }

        let triples = match parse_line(format, &line) {
            Err(e) => {
                debug!(err = %e, "skipping malformed line");
                ctx.errors += 1;
                ctx.lines_processed += 1;
                continue;
            }
            Ok(record) => match (transform)(record, &ctx.tx_id) {
                Err(e) => {
                    warn!(err = %e, "transform failed, skipping record");
                    ctx.errors += 1;
                    ctx.lines_processed += 1;
                    continue;
                }
                Ok(triples) => triples,
            },
        };
        ctx.lines_processed += 1;

        ctx.writer.add_triples(triples).await?;
        if ctx.writer.is_backpressured() {
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}

/// Flushes the writer and persists a checkpoint at the current position.
async fn persist_checkpoint(
    ctx: &mut JobContext,
    checkpoints: &CheckpointStore,
    job_id: &str,
    source_url: &str,
) -> Result<(), ImportError> {
    ctx.writer.flush().await?;
    let writer_state = ctx.writer.snapshot().await?;

    let checkpoint = ImportCheckpoint {
        job_id: job_id.to_string(),
        source_url: source_url.to_string(),
        byte_offset: ctx.next_offset,
        total_bytes: ctx.total_bytes,
        lines_processed: ctx.lines_processed,
        triples_written: ctx.writer.triples_written(),
        line_reader_state: serde_json::to_value(ctx.reader.snapshot())?,
        batch_writer_state: serde_json::to_value(&writer_state)?,
        checkpointed_at: 0,
        metadata: Some(json!({ "txId": ctx.tx_id })),
    };
    checkpoints
        .save(&checkpoint)
        .await
        .map_err(|e| ImportError::Checkpoint(e.to_string()))
}
