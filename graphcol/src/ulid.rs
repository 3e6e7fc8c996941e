//! Lexicographically sortable transaction ids (ULIDs).
//!
//! A ULID is 128 bits: a 48-bit millisecond timestamp followed by 80 bits
//! of randomness, rendered as 26 Crockford base32 characters. Because the
//! timestamp occupies the high bits, lexicographic order on the encoded
//! form equals numeric order on the raw value.
//!
//! Monotonicity is a property of a [UlidGenerator] value, not of the
//! module: ids issued by one generator within the same millisecond reuse
//! the previous randomness incremented by one, so they are strictly
//! increasing. Construct one generator per process (or per job) and thread
//! it explicitly.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;

use crate::base32;

/// Characters in the canonical text form.
pub const ULID_LEN: usize = 26;

const TIMESTAMP_BITS: u32 = 48;
const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;

#[derive(Debug, Eq, PartialEq, Error)]
pub enum UlidError {
    #[error("invalid ulid: {0}")]
    Encoding(#[from] base32::Base32DecodeError),
    #[error("timestamp {0} exceeds 48 bits")]
    TimestampOverflow(u64),
    #[error("randomness exceeds 80 bits")]
    RandomOverflow,
}

/// A parsed, validated ULID.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ulid(u128);

impl Ulid {
    pub fn from_parts(timestamp_ms: u64, random: u128) -> Result<Self, UlidError> {
        if timestamp_ms >= 1 << TIMESTAMP_BITS {
            return Err(UlidError::TimestampOverflow(timestamp_ms));
        }
        if random > RANDOM_MASK {
            return Err(UlidError::RandomOverflow);
        }
        Ok(Self(((timestamp_ms as u128) << RANDOM_BITS) | random))
    }

    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> RANDOM_BITS) as u64
    }

    pub fn random(&self) -> u128 {
        self.0 & RANDOM_MASK
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn from_u128(v: u128) -> Self {
        Self(v)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base32::encode_u128(self.0))
    }
}

impl fmt::Debug for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ulid({})", self)
    }
}

impl FromStr for Ulid {
    type Err = UlidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base32::decode_u128(s)?))
    }
}

impl serde::Serialize for Ulid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Ulid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Issues monotonically increasing [Ulid]s.
pub struct UlidGenerator {
    last: Option<(u64, u128)>,
}

impl UlidGenerator {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Issues the next id using the system clock.
    pub fn generate(&mut self) -> Ulid {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.generate_at(now_ms)
    }

    /// Issues the next id for the given wall-clock reading.
    ///
    /// Ids remain strictly increasing even if the clock reads the same
    /// millisecond repeatedly or steps backwards: the previous randomness
    /// is incremented, carrying into the timestamp on the (astronomically
    /// unlikely) overflow of the 80-bit field.
    pub fn generate_at(&mut self, now_ms: u64) -> Ulid {
        let next = match self.last {
            Some((last_ms, last_random)) if now_ms <= last_ms => {
                if last_random < RANDOM_MASK {
                    (last_ms, last_random + 1)
                } else {
                    (last_ms + 1, 0)
                }
            }
            _ => (now_ms, rand::thread_rng().gen_range(0..=RANDOM_MASK)),
        };
        self.last = Some(next);
        // 48-bit timestamps don't run out until the year 10889.
        Ulid::from_parts(next.0 & ((1 << TIMESTAMP_BITS) - 1), next.1)
            .expect("parts are masked to their widths")
    }
}

impl Default for UlidGenerator {
    fn default() -> Self {
        Self::new()
    }
}
