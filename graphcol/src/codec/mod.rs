//! The GraphCol columnar batch format, version 1.
//!
//! A chunk stores one batch of triples from a single namespace in a
//! columnar layout: a shared string dictionary deduplicates subjects
//! (prefix-stripped by the namespace), predicates and string values;
//! numeric columns are delta-compressed ZigZag varints; timestamps are
//! delta-of-delta against a per-chunk base; transaction ids are a base
//! ULID plus per-row deltas. The frame is closed by a CRC-32 and the total
//! length, so truncation and corruption are detected before any triple is
//! handed to a caller.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ magic "GCOL" · version u16 · count u32 · ns │ header
//! │ string dictionary                           │
//! │ subject / predicate / tag columns           │
//! │ value columns, grouped per variant          │
//! │ timestamp column · txid column              │
//! │ crc32 u32 · total length u32 · magic "GCOL" │ trailer
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Insertion order is preserved: the tag column records the variant of
//! every row, and decoding re-interleaves the per-variant columns by
//! replaying that sequence.

mod decode;
mod encode;

use thiserror::Error;

use crate::ident::IdentError;
use crate::ident::Namespace;
use crate::triple::{Triple, TripleError};
use crate::varint;

pub use decode::decode;
pub use encode::encode;

/// `GCOL`, opening and closing every chunk.
pub const MAGIC: [u8; 4] = *b"GCOL";

/// The only version this module reads and writes.
pub const VERSION: u16 = 1;

/// Byte length of the trailer: crc32 + total length + closing magic.
pub(crate) const TRAILER_LEN: usize = 12;

/// A decoded chunk: the namespace it was encoded under and its triples in
/// insertion order.
#[derive(Debug, PartialEq)]
pub struct Batch {
    pub namespace: Namespace,
    pub triples: Vec<Triple>,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("batch of {0} triples exceeds the u32 count field")]
    TooManyTriples(usize),
    #[error(transparent)]
    Varint(#[from] varint::EncodeError),
    #[error("value is not representable as canonical JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("section truncated at offset {0}")]
    TruncatedSection(usize),
    #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("declared length {declared} does not match frame length {actual}")]
    LengthMismatch { declared: u64, actual: usize },
    #[error("{0} undeclared bytes between the last column and the trailer")]
    TrailingBytes(usize),
    #[error("unknown value variant {0}")]
    UnknownVariant(u8),
    #[error("dictionary index {index} out of bounds ({len} entries)")]
    BadDictIndex { index: u64, len: usize },
    #[error("invalid UTF-8 in string section")]
    InvalidUtf8,
    #[error(transparent)]
    Varint(#[from] varint::DecodeError),
    #[error(transparent)]
    Ident(#[from] IdentError),
    #[error(transparent)]
    Triple(#[from] TripleError),
    #[error("value failed canonical JSON parsing: {0}")]
    Json(#[from] serde_json::Error),
}
