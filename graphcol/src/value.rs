//! The tagged object value of a triple.
//!
//! Eighteen variants cover everything a dataset can attach to an entity.
//! [ValueTag] is the one-byte wire discriminant; keeping it separate from
//! the payload-carrying [Value] lets encoders and decoders match
//! exhaustively, so adding a variant is a compile error everywhere it
//! matters rather than a silently skipped `_` arm.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ident::EntityUrl;

lazy_static! {
    // ISO-8601 duration: P(nY)?(nM)?(nW)?(nD)?(T(nH)?(nM)?(n(.n)?S)?)?
    static ref DURATION_RE: regex::Regex = regex::Regex::new(
        r"^P(\d+Y)?(\d+M)?(\d+W)?(\d+D)?(T(\d+H)?(\d+M)?(\d+(\.\d+)?S)?)?$"
    )
    .unwrap();
}

#[derive(Debug, PartialEq, Error)]
pub enum ValueError {
    #[error("value {0} is outside the 32-bit signed integer range")]
    Int32OutOfRange(i64),
    #[error("float value must be finite")]
    NonFiniteFloat,
    #[error("vector element {0} is not finite")]
    NonFiniteVectorElement(usize),
    #[error("{0:?} is not an ISO-8601 duration")]
    InvalidDuration(String),
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// A point on the globe, degrees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// An ordered sequence of points.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoLineString {
    pub points: Vec<GeoPoint>,
}

/// An exterior ring plus optional holes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPolygon {
    pub exterior: Vec<GeoPoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holes: Vec<Vec<GeoPoint>>,
}

/// One-byte wire discriminant for [Value].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    Null = 0,
    Bool = 1,
    Int32 = 2,
    Int64 = 3,
    Float64 = 4,
    String = 5,
    Binary = 6,
    Timestamp = 7,
    Date = 8,
    Duration = 9,
    Ref = 10,
    RefArray = 11,
    Json = 12,
    GeoPoint = 13,
    GeoPolygon = 14,
    GeoLineString = 15,
    Url = 16,
    Vector = 17,
}

/// All tags, in discriminant order. Value columns are emitted in this
/// order inside a chunk.
pub const ALL_TAGS: [ValueTag; 18] = [
    ValueTag::Null,
    ValueTag::Bool,
    ValueTag::Int32,
    ValueTag::Int64,
    ValueTag::Float64,
    ValueTag::String,
    ValueTag::Binary,
    ValueTag::Timestamp,
    ValueTag::Date,
    ValueTag::Duration,
    ValueTag::Ref,
    ValueTag::RefArray,
    ValueTag::Json,
    ValueTag::GeoPoint,
    ValueTag::GeoPolygon,
    ValueTag::GeoLineString,
    ValueTag::Url,
    ValueTag::Vector,
];

impl ValueTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ValueTag::Null,
            1 => ValueTag::Bool,
            2 => ValueTag::Int32,
            3 => ValueTag::Int64,
            4 => ValueTag::Float64,
            5 => ValueTag::String,
            6 => ValueTag::Binary,
            7 => ValueTag::Timestamp,
            8 => ValueTag::Date,
            9 => ValueTag::Duration,
            10 => ValueTag::Ref,
            11 => ValueTag::RefArray,
            12 => ValueTag::Json,
            13 => ValueTag::GeoPoint,
            14 => ValueTag::GeoPolygon,
            15 => ValueTag::GeoLineString,
            16 => ValueTag::Url,
            17 => ValueTag::Vector,
            _ => return None,
        })
    }
}

/// A triple's object.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Tombstone: the predicate is deleted as of the triple's timestamp.
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Binary(Vec<u8>),
    /// Unsigned milliseconds since epoch.
    Timestamp(u64),
    /// Signed days since epoch.
    Date(i32),
    /// ISO-8601 duration string.
    Duration(String),
    Ref(EntityUrl),
    RefArray(Vec<EntityUrl>),
    Json(serde_json::Value),
    GeoPoint(GeoPoint),
    GeoPolygon(GeoPolygon),
    GeoLineString(GeoLineString),
    /// A plain validated URL that is not an entity reference.
    Url(EntityUrl),
    Vector(Vec<f64>),
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Null => ValueTag::Null,
            Value::Bool(_) => ValueTag::Bool,
            Value::Int32(_) => ValueTag::Int32,
            Value::Int64(_) => ValueTag::Int64,
            Value::Float64(_) => ValueTag::Float64,
            Value::String(_) => ValueTag::String,
            Value::Binary(_) => ValueTag::Binary,
            Value::Timestamp(_) => ValueTag::Timestamp,
            Value::Date(_) => ValueTag::Date,
            Value::Duration(_) => ValueTag::Duration,
            Value::Ref(_) => ValueTag::Ref,
            Value::RefArray(_) => ValueTag::RefArray,
            Value::Json(_) => ValueTag::Json,
            Value::GeoPoint(_) => ValueTag::GeoPoint,
            Value::GeoPolygon(_) => ValueTag::GeoPolygon,
            Value::GeoLineString(_) => ValueTag::GeoLineString,
            Value::Url(_) => ValueTag::Url,
            Value::Vector(_) => ValueTag::Vector,
        }
    }

    /// Is this a deletion marker?
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Bounds-checked construction of an [Value::Int32] from a wider
    /// integer.
    pub fn int32_from_i64(v: i64) -> Result<Self, ValueError> {
        i32::try_from(v)
            .map(Value::Int32)
            .map_err(|_| ValueError::Int32OutOfRange(v))
    }

    /// Checks the payload constraints that the Rust types alone cannot
    /// express. Entity URLs inside `Ref`/`RefArray`/`Url` are validated by
    /// construction already.
    pub fn validate(&self) -> Result<(), ValueError> {
        match self {
            Value::Null => Ok(()),
            Value::Bool(_) => Ok(()),
            Value::Int32(_) => Ok(()),
            Value::Int64(_) => Ok(()),
            Value::Float64(v) => {
                if v.is_finite() {
                    Ok(())
                } else {
                    Err(ValueError::NonFiniteFloat)
                }
            }
            Value::String(_) => Ok(()),
            Value::Binary(_) => Ok(()),
            Value::Timestamp(_) => Ok(()),
            Value::Date(_) => Ok(()),
            Value::Duration(d) => validate_duration(d),
            Value::Ref(_) => Ok(()),
            Value::RefArray(_) => Ok(()),
            Value::Json(_) => Ok(()),
            Value::GeoPoint(p) => validate_point(p),
            Value::GeoPolygon(polygon) => {
                for p in polygon.exterior.iter().chain(polygon.holes.iter().flatten()) {
                    validate_point(p)?;
                }
                Ok(())
            }
            Value::GeoLineString(line) => {
                for p in &line.points {
                    validate_point(p)?;
                }
                Ok(())
            }
            Value::Url(_) => Ok(()),
            Value::Vector(v) => {
                if let Some(i) = v.iter().position(|x| !x.is_finite()) {
                    return Err(ValueError::NonFiniteVectorElement(i));
                }
                Ok(())
            }
        }
    }
}

fn validate_point(p: &GeoPoint) -> Result<(), ValueError> {
    if !(p.lat.is_finite() && (-90.0..=90.0).contains(&p.lat)) {
        return Err(ValueError::LatitudeOutOfRange(p.lat));
    }
    if !(p.lng.is_finite() && (-180.0..=180.0).contains(&p.lng)) {
        return Err(ValueError::LongitudeOutOfRange(p.lng));
    }
    Ok(())
}

fn validate_duration(input: &str) -> Result<(), ValueError> {
    // The regex admits a bare "P" (and a dangling "T"); neither names a
    // duration.
    let well_formed = DURATION_RE.is_match(input)
        && input.len() > 1
        && !input.ends_with('T');
    if well_formed {
        Ok(())
    } else {
        Err(ValueError::InvalidDuration(input.to_string()))
    }
}
