//! Bloom filters sized from a capacity and a target false-positive rate.
//!
//! One filter is attached to every chunk (capacity = unique entities in
//! the batch) and one combined filter covers the whole namespace, so
//! lookups can route to candidate chunks without reading chunk bodies.
//! Two filters with identical geometry `(m, k)` can be merged by OR-ing
//! their bits, which is how the combined filter absorbs resumed jobs.

use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::fnv1a_pair;

/// Serialization format version.
const VERSION: u32 = 1;

pub const DEFAULT_TARGET_FPR: f64 = 0.01;

/// Size cap for a per-chunk filter.
pub const CHUNK_FILTER_MAX_BYTES: usize = 16 * 1024;

/// Size cap for a per-namespace combined filter.
pub const COMBINED_FILTER_MAX_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum BloomError {
    #[error("capacity must be at least 1")]
    ZeroCapacity,
    #[error("target false-positive rate {0} is outside (0, 1)")]
    TargetFprOutOfRange(f64),
    #[error("filters disagree on geometry: ({0}, {1}) vs ({2}, {3})")]
    GeometryMismatch(u64, u32, u64, u32),
    #[error("declared m = {declared} does not match {actual} filter bits")]
    BitLengthMismatch { declared: u64, actual: u64 },
    #[error("unsupported filter version {0}")]
    UnsupportedVersion(u32),
    #[error("filter bits are not valid base64: {0}")]
    Base64(#[from] data_encoding::DecodeError),
}

/// A definitive "no" or an inconclusive "maybe".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    /// The id was certainly never added.
    Absent,
    /// The id may have been added; false positives happen at roughly the
    /// expected rate.
    MaybePresent,
}

#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    /// Number of bits; always `bits.len() * 8`.
    m: u64,
    /// Number of probe positions per id.
    k: u32,
    /// Ids added so far (approximate after a merge).
    count: u64,
    capacity: u64,
    target_fpr: f64,
    expected_fpr: f64,
}

/// The portable JSON form: geometry, base64 bits and sizing metadata.
#[derive(Serialize, Deserialize)]
pub struct BloomFilterJson {
    pub filter: String,
    pub k: u32,
    pub m: u64,
    pub version: u32,
    pub meta: BloomFilterMeta,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomFilterMeta {
    pub count: u64,
    pub capacity: u64,
    pub target_fpr: f64,
    pub expected_fpr: f64,
    pub size_bytes: u64,
}

impl BloomFilter {
    /// Sizes a filter for `capacity` ids at `target_fpr`, capping the bit
    /// array at `max_size_bytes`.
    ///
    /// `m = ⌈−n·ln(p)/ln²(2)⌉` rounded up to a byte boundary;
    /// `k = max(1, round((m/n)·ln 2))`. When the cap bites, the realized
    /// false-positive rate rises above the target; the expectation for
    /// the actual geometry is computed and kept alongside.
    pub fn with_capacity(
        capacity: u64,
        target_fpr: f64,
        max_size_bytes: usize,
    ) -> Result<Self, BloomError> {
        if capacity == 0 {
            return Err(BloomError::ZeroCapacity);
        }
        if !(target_fpr > 0.0 && target_fpr < 1.0) {
            return Err(BloomError::TargetFprOutOfRange(target_fpr));
        }

        let n = capacity as f64;
        let ln2 = std::f64::consts::LN_2;
        let ideal_bits = (-n * target_fpr.ln() / (ln2 * ln2)).ceil();
        let size_bytes = ((ideal_bits / 8.0).ceil() as usize).clamp(1, max_size_bytes);
        let m = (size_bytes * 8) as u64;
        let k = ((m as f64 / n) * ln2).round().max(1.0) as u32;
        let expected_fpr = expected_fpr(m, k, capacity);

        Ok(Self {
            bits: vec![0; size_bytes],
            m,
            k,
            count: 0,
            capacity,
            target_fpr,
            expected_fpr,
        })
    }

    pub fn m(&self) -> u64 {
        self.m
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn expected_fpr(&self) -> f64 {
        self.expected_fpr
    }

    fn positions(&self, id: &str) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = fnv1a_pair(id.as_bytes());
        let m = self.m;
        (0..self.k as u64).map(move |i| (h1 as u64 + i * h2 as u64) % m)
    }

    pub fn add(&mut self, id: &str) {
        let positions: Vec<u64> = self.positions(id).collect();
        for bit in positions {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        self.count += 1;
    }

    pub fn might_contain(&self, id: &str) -> Membership {
        for bit in self.positions(id) {
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return Membership::Absent;
            }
        }
        Membership::MaybePresent
    }

    /// OR-merges `other` into `self`. Both filters must share `(m, k)`.
    /// The resulting count is the sum, which over-counts ids present in
    /// both.
    pub fn merge(&mut self, other: &BloomFilter) -> Result<(), BloomError> {
        if self.m != other.m || self.k != other.k {
            return Err(BloomError::GeometryMismatch(
                self.m, self.k, other.m, other.k,
            ));
        }
        for (ours, theirs) in self.bits.iter_mut().zip(&other.bits) {
            *ours |= theirs;
        }
        self.count += other.count;
        Ok(())
    }

    /// Fraction of bits set.
    pub fn fill_rate(&self) -> f64 {
        let set: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        set as f64 / self.m as f64
    }

    /// Measures the false-positive rate empirically by probing
    /// `sample_count` ids that were never added.
    pub fn estimate_fpr(&self, sample_count: usize) -> f64 {
        if sample_count == 0 {
            return 0.0;
        }
        let positives = (0..sample_count)
            .filter(|i| {
                self.might_contain(&format!("__fpr_probe__{}", i)) == Membership::MaybePresent
            })
            .count();
        positives as f64 / sample_count as f64
    }

    pub fn to_json(&self) -> BloomFilterJson {
        BloomFilterJson {
            filter: BASE64.encode(&self.bits),
            k: self.k,
            m: self.m,
            version: VERSION,
            meta: BloomFilterMeta {
                count: self.count,
                capacity: self.capacity,
                target_fpr: self.target_fpr,
                expected_fpr: self.expected_fpr,
                size_bytes: self.bits.len() as u64,
            },
        }
    }

    pub fn from_json(json: &BloomFilterJson) -> Result<Self, BloomError> {
        if json.version != VERSION {
            return Err(BloomError::UnsupportedVersion(json.version));
        }
        let bits = BASE64.decode(json.filter.as_bytes())?;
        if json.m != bits.len() as u64 * 8 {
            return Err(BloomError::BitLengthMismatch {
                declared: json.m,
                actual: bits.len() as u64 * 8,
            });
        }
        Ok(Self {
            bits,
            m: json.m,
            k: json.k,
            count: json.meta.count,
            capacity: json.meta.capacity,
            target_fpr: json.meta.target_fpr,
            expected_fpr: json.meta.expected_fpr,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("m", &self.m)
            .field("k", &self.k)
            .field("count", &self.count)
            .field("capacity", &self.capacity)
            .field("fill_rate", &self.fill_rate())
            .finish()
    }
}

/// Expected false-positive rate of the realized geometry after `n`
/// insertions: `(1 − e^(−k·n/m))^k`.
fn expected_fpr(m: u64, k: u32, n: u64) -> f64 {
    (1.0 - (-(k as f64) * n as f64 / m as f64).exp()).powi(k as i32)
}
