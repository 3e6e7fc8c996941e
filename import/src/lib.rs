//! Streaming ingestion for the graphlake core.
//!
//! Takes a large remote dataset (NDJSON or TSV, optionally gzipped),
//! pulls it through a bounded-memory pipeline and lands it as GraphCol
//! chunks with bloom indexes and a manifest: `fetch(range) →
//! decompress? → split lines → parse record → transform → batch →
//! upload chunk → checkpoint`. Jobs are resumable from their durable
//! checkpoint at any window boundary.

pub mod error;
pub mod fetcher;
pub mod importer;
pub mod line_reader;
pub mod record;
#[cfg(test)]
pub(crate) mod testing;

pub use error::ImportError;
pub use fetcher::{
    ContentRange, FetchedWindow, HttpClient, HttpResponse, RangeFetcher, RangeFetcherConfig,
    ReqwestClient,
};
pub use importer::{
    ImportConfig, ImportSummary, JobState, JobStatus, StepOutcome, StreamingImporter, Transform,
};
pub use line_reader::{LineReaderState, StreamingLineReader};
pub use record::{parse_line, Record, RecordFormat};
