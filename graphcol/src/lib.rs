//! Data model and binary formats for the graphlake core.
//!
//! This crate is deliberately I/O-free: it defines the triple data model,
//! the identifier validation rules enforced at the core boundary, and the
//! GraphCol columnar chunk format, plus the binary primitives (varints,
//! CRC-32, Crockford base32) those are built from. Storage and ingestion
//! live in the crates layered on top.

pub mod base32;
pub mod codec;
pub mod crc32;
pub mod ident;
pub mod triple;
pub mod ulid;
pub mod value;
pub mod varint;

pub use codec::{decode, encode, Batch};
pub use ident::{EntityUrl, Namespace, Predicate};
pub use triple::{current_value, latest, Triple};
pub use ulid::{Ulid, UlidGenerator};
pub use value::{Value, ValueTag};
