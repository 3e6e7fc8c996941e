use std::collections::HashMap;

use crate::crc32;
use crate::ident::Namespace;
use crate::triple::Triple;
use crate::value::{Value, ValueTag, ALL_TAGS};
use crate::varint;

use super::{EncodeError, MAGIC, VERSION};

/// String dictionary in first-appearance order.
#[derive(Default)]
struct DictBuilder {
    entries: Vec<String>,
    index: HashMap<String, u64>,
}

impl DictBuilder {
    fn intern(&mut self, s: &str) -> u64 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.entries.len() as u64;
        self.entries.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }
}

/// How a subject is stored: a dictionary index plus whether the entry is
/// the namespace-stripped suffix or a verbatim foreign URL.
#[derive(Clone, Copy)]
struct SubjectRef {
    dict_idx: u64,
    verbatim: bool,
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }

    fn varint(&mut self, v: u64) -> Result<(), EncodeError> {
        varint::encode(v, &mut self.out)?;
        Ok(())
    }

    fn varint_raw(&mut self, v: u64) {
        varint::encode_raw(v, &mut self.out);
    }

    fn signed(&mut self, v: i64) {
        varint::encode_signed(v, &mut self.out);
    }

    fn len_prefixed(&mut self, v: &[u8]) -> Result<(), EncodeError> {
        self.varint(v.len() as u64)?;
        self.bytes(v);
        Ok(())
    }
}

/// Encodes a batch of triples under `namespace` into a self-describing
/// GraphCol frame. Deterministic for a given input.
pub fn encode(triples: &[Triple], namespace: &Namespace) -> Result<Vec<u8>, EncodeError> {
    let count =
        u32::try_from(triples.len()).map_err(|_| EncodeError::TooManyTriples(triples.len()))?;

    // First pass: build the shared dictionary in first-appearance order,
    // visiting subject, predicate, then string value per triple.
    let mut dict = DictBuilder::default();
    let mut subjects = Vec::with_capacity(triples.len());
    let mut predicates = Vec::with_capacity(triples.len());
    for triple in triples {
        let subject = match namespace.strip_prefix(triple.subject.as_str()) {
            Some(suffix) => SubjectRef {
                dict_idx: dict.intern(suffix),
                verbatim: false,
            },
            None => SubjectRef {
                dict_idx: dict.intern(triple.subject.as_str()),
                verbatim: true,
            },
        };
        subjects.push(subject);
        predicates.push(dict.intern(triple.predicate.as_str()));
        if let Value::String(s) = &triple.object {
            dict.intern(s);
        }
    }

    let mut w = Writer { out: Vec::new() };

    // Header.
    w.bytes(&MAGIC);
    w.bytes(&VERSION.to_le_bytes());
    w.bytes(&count.to_le_bytes());
    w.len_prefixed(namespace.as_str().as_bytes())?;

    // Dictionary.
    w.varint(dict.entries.len() as u64)?;
    for entry in &dict.entries {
        w.len_prefixed(entry.as_bytes())?;
    }

    // Subject and predicate columns.
    for subject in &subjects {
        w.varint((subject.dict_idx << 1) | subject.verbatim as u64)?;
    }
    for &idx in &predicates {
        w.varint(idx)?;
    }

    // Tag column.
    for triple in triples {
        w.u8(triple.object.tag() as u8);
    }

    // Value columns, grouped per variant in discriminant order.
    for tag in ALL_TAGS {
        encode_column(&mut w, triples, namespace, &dict, tag)?;
    }

    // Timestamp column: base, then delta-of-delta per row.
    if !triples.is_empty() {
        let base = triples.iter().map(|t| t.timestamp).min().unwrap();
        w.varint_raw(base);
        let mut prev_ts = base;
        let mut prev_delta: i64 = 0;
        for triple in triples {
            let delta = triple.timestamp.wrapping_sub(prev_ts) as i64;
            w.signed(delta.wrapping_sub(prev_delta));
            prev_ts = triple.timestamp;
            prev_delta = delta;
        }
    }

    // Transaction id column: the first row's ULID verbatim, later rows as
    // deltas from their predecessor. A delta of `v` is written as `v + 1`;
    // zero escapes to a full 16-byte id for rows that moved backwards or
    // too far forward.
    if let Some(first) = triples.first() {
        w.bytes(&first.tx_id.to_bytes());
        let mut prev = first.tx_id.as_u128();
        for triple in &triples[1..] {
            let cur = triple.tx_id.as_u128();
            match cur.checked_sub(prev) {
                Some(delta) if delta < varint::MAX as u128 => {
                    w.varint(delta as u64 + 1)?;
                }
                _ => {
                    w.varint(0)?;
                    w.bytes(&triple.tx_id.to_bytes());
                }
            }
            prev = cur;
        }
    }

    // Trailer.
    let crc = crc32::checksum(&w.out);
    w.bytes(&crc.to_le_bytes());
    let total_len = w.out.len() as u32 + 8;
    w.bytes(&total_len.to_le_bytes());
    w.bytes(&MAGIC);

    Ok(w.out)
}

fn encode_column(
    w: &mut Writer,
    triples: &[Triple],
    namespace: &Namespace,
    dict: &DictBuilder,
    tag: ValueTag,
) -> Result<(), EncodeError> {
    let mut prev_i64: i64 = 0;
    let mut prev_u64: u64 = 0;
    let mut prev_i32: i32 = 0;

    for triple in triples.iter().filter(|t| t.object.tag() == tag) {
        match &triple.object {
            Value::Null => {}
            Value::Bool(v) => w.u8(*v as u8),
            Value::Int32(v) => {
                let delta = v.wrapping_sub(prev_i32);
                w.signed(delta as i64);
                prev_i32 = *v;
            }
            Value::Int64(v) => {
                w.signed(v.wrapping_sub(prev_i64));
                prev_i64 = *v;
            }
            Value::Float64(v) => w.bytes(&v.to_le_bytes()),
            Value::String(s) => {
                // Interned during the first pass.
                w.varint(dict.index[s.as_str()])?;
            }
            Value::Binary(b) => w.len_prefixed(b)?,
            Value::Timestamp(v) => {
                w.signed(v.wrapping_sub(prev_u64) as i64);
                prev_u64 = *v;
            }
            Value::Date(v) => {
                let delta = v.wrapping_sub(prev_i32);
                w.signed(delta as i64);
                prev_i32 = *v;
            }
            Value::Duration(d) => w.len_prefixed(d.as_bytes())?,
            Value::Ref(url) => encode_ref(w, namespace, url.as_str())?,
            Value::RefArray(refs) => {
                w.varint(refs.len() as u64)?;
                for url in refs {
                    encode_ref(w, namespace, url.as_str())?;
                }
            }
            Value::Json(v) => w.len_prefixed(serde_json::to_string(v)?.as_bytes())?,
            Value::GeoPoint(p) => w.len_prefixed(serde_json::to_string(p)?.as_bytes())?,
            Value::GeoPolygon(p) => w.len_prefixed(serde_json::to_string(p)?.as_bytes())?,
            Value::GeoLineString(l) => w.len_prefixed(serde_json::to_string(l)?.as_bytes())?,
            Value::Url(url) => w.len_prefixed(url.as_str().as_bytes())?,
            Value::Vector(v) => {
                w.varint(v.len() as u64)?;
                for x in v {
                    w.bytes(&x.to_le_bytes());
                }
            }
        }
    }
    Ok(())
}

/// Refs are prefix-stripped like subjects: a flag byte distinguishes a
/// namespace suffix from a verbatim foreign URL.
fn encode_ref(w: &mut Writer, namespace: &Namespace, url: &str) -> Result<(), EncodeError> {
    match namespace.strip_prefix(url) {
        Some(suffix) => {
            w.u8(0);
            w.len_prefixed(suffix.as_bytes())
        }
        None => {
            w.u8(1);
            w.len_prefixed(url.as_bytes())
        }
    }
}
