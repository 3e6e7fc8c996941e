use std::collections::VecDeque;

use crate::crc32;
use crate::ident::{EntityUrl, Namespace, Predicate};
use crate::triple::Triple;
use crate::ulid::Ulid;
use crate::value::{GeoLineString, GeoPoint, GeoPolygon, Value, ValueTag, ALL_TAGS};
use crate::varint;

use super::{Batch, DecodeError, MAGIC, TRAILER_LEN, VERSION};

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.buf.len() {
            return Err(DecodeError::TruncatedSection(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let (v, n) = varint::decode(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(v)
    }

    fn varint_raw(&mut self) -> Result<u64, DecodeError> {
        let (v, n) = varint::decode_raw(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(v)
    }

    fn signed(&mut self) -> Result<i64, DecodeError> {
        let (v, n) = varint::decode_signed(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(v)
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("took eight bytes");
        Ok(f64::from_le_bytes(bytes))
    }

    fn len_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.varint()?;
        self.take(len as usize)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.len_prefixed()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

/// Decodes a GraphCol frame back into its namespace and triples.
///
/// The frame is verified before any section is parsed: magic at both
/// ends, version, the declared total length, and the CRC over everything
/// preceding the trailer. Every string is re-validated as it would be at
/// the original core boundary.
pub fn decode(buf: &[u8]) -> Result<Batch, DecodeError> {
    // Header magic and version come first so callers get the most
    // specific error for the common failure modes.
    if buf.len() < MAGIC.len() + 2 || buf[..MAGIC.len()] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().expect("two bytes"));
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    // Frame integrity: trailer magic, declared length, CRC.
    if buf.len() < MAGIC.len() + 2 + 4 + TRAILER_LEN {
        return Err(DecodeError::TruncatedSection(buf.len()));
    }
    let trailer = &buf[buf.len() - TRAILER_LEN..];
    if trailer[8..] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let declared = u32::from_le_bytes(trailer[4..8].try_into().expect("four bytes")) as u64;
    if declared != buf.len() as u64 {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }
    let stored = u32::from_le_bytes(trailer[..4].try_into().expect("four bytes"));
    let computed = crc32::checksum(&buf[..buf.len() - TRAILER_LEN]);
    if stored != computed {
        return Err(DecodeError::CrcMismatch { stored, computed });
    }

    let mut cursor = Cursor {
        buf: &buf[..buf.len() - TRAILER_LEN],
        pos: 6,
    };

    let count = u32::from_le_bytes(cursor.take(4)?.try_into().expect("four bytes")) as usize;
    let namespace = Namespace::parse(&cursor.string()?)?;

    // Dictionary.
    let dict_len = cursor.varint()? as usize;
    let mut dict = Vec::with_capacity(dict_len);
    for _ in 0..dict_len {
        dict.push(cursor.string()?);
    }
    // Subject and predicate columns.
    let mut subjects = Vec::with_capacity(count);
    for _ in 0..count {
        let packed = cursor.varint()?;
        let entry = lookup(&dict, packed >> 1)?;
        let url = if packed & 1 == 1 {
            EntityUrl::parse(entry)?
        } else {
            EntityUrl::parse(&namespace.rejoin(entry))?
        };
        subjects.push(url);
    }
    let mut predicates = Vec::with_capacity(count);
    for _ in 0..count {
        let idx = cursor.varint()?;
        predicates.push(Predicate::parse(lookup(&dict, idx)?)?);
    }

    // Tag column.
    let mut tags = Vec::with_capacity(count);
    for _ in 0..count {
        let byte = cursor.u8()?;
        tags.push(ValueTag::from_u8(byte).ok_or(DecodeError::UnknownVariant(byte))?);
    }

    // Per-variant value columns, then re-interleaved by the tag sequence.
    let mut columns: Vec<VecDeque<Value>> = Vec::with_capacity(ALL_TAGS.len());
    for tag in ALL_TAGS {
        let occurrences = tags.iter().filter(|t| **t == tag).count();
        columns.push(decode_column(&mut cursor, &namespace, &dict, tag, occurrences)?);
    }
    let mut values = Vec::with_capacity(count);
    for tag in &tags {
        let value = columns[*tag as u8 as usize]
            .pop_front()
            .expect("column holds one value per tag occurrence");
        values.push(value);
    }

    // Timestamp column.
    let mut timestamps = Vec::with_capacity(count);
    if count > 0 {
        let base = cursor.varint_raw()?;
        let mut prev_ts = base;
        let mut prev_delta: i64 = 0;
        for _ in 0..count {
            let delta = prev_delta.wrapping_add(cursor.signed()?);
            let ts = prev_ts.wrapping_add(delta as u64);
            timestamps.push(ts);
            prev_ts = ts;
            prev_delta = delta;
        }
    }

    // Transaction id column.
    let mut tx_ids = Vec::with_capacity(count);
    if count > 0 {
        let base = Ulid::from_bytes(cursor.take(16)?.try_into().expect("sixteen bytes"));
        tx_ids.push(base);
        let mut prev = base.as_u128();
        for _ in 1..count {
            let v = cursor.varint()?;
            let cur = if v == 0 {
                Ulid::from_bytes(cursor.take(16)?.try_into().expect("sixteen bytes")).as_u128()
            } else {
                prev.wrapping_add((v - 1) as u128)
            };
            tx_ids.push(Ulid::from_u128(cur));
            prev = cur;
        }
    }

    if cursor.pos != cursor.buf.len() {
        return Err(DecodeError::TrailingBytes(cursor.buf.len() - cursor.pos));
    }

    let mut triples = Vec::with_capacity(count);
    for (((subject, predicate), (value, timestamp)), tx_id) in subjects
        .into_iter()
        .zip(predicates)
        .zip(values.into_iter().zip(timestamps))
        .zip(tx_ids)
    {
        triples.push(Triple::new(subject, predicate, value, timestamp, tx_id)?);
    }

    Ok(Batch { namespace, triples })
}

fn lookup<'d>(dict: &'d [String], index: u64) -> Result<&'d str, DecodeError> {
    dict.get(index as usize)
        .map(String::as_str)
        .ok_or(DecodeError::BadDictIndex {
            index,
            len: dict.len(),
        })
}

fn decode_column(
    cursor: &mut Cursor<'_>,
    namespace: &Namespace,
    dict: &[String],
    tag: ValueTag,
    occurrences: usize,
) -> Result<VecDeque<Value>, DecodeError> {
    let mut column = VecDeque::with_capacity(occurrences);
    let mut prev_i64: i64 = 0;
    let mut prev_u64: u64 = 0;
    let mut prev_i32: i32 = 0;

    for _ in 0..occurrences {
        let value = match tag {
            ValueTag::Null => Value::Null,
            ValueTag::Bool => Value::Bool(cursor.u8()? != 0),
            ValueTag::Int32 => {
                let v = prev_i32.wrapping_add(cursor.signed()? as i32);
                prev_i32 = v;
                Value::Int32(v)
            }
            ValueTag::Int64 => {
                let v = prev_i64.wrapping_add(cursor.signed()?);
                prev_i64 = v;
                Value::Int64(v)
            }
            ValueTag::Float64 => Value::Float64(cursor.f64()?),
            ValueTag::String => Value::String(lookup(dict, cursor.varint()?)?.to_string()),
            ValueTag::Binary => Value::Binary(cursor.len_prefixed()?.to_vec()),
            ValueTag::Timestamp => {
                let v = prev_u64.wrapping_add(cursor.signed()? as u64);
                prev_u64 = v;
                Value::Timestamp(v)
            }
            ValueTag::Date => {
                let v = prev_i32.wrapping_add(cursor.signed()? as i32);
                prev_i32 = v;
                Value::Date(v)
            }
            ValueTag::Duration => Value::Duration(cursor.string()?),
            ValueTag::Ref => Value::Ref(decode_ref(cursor, namespace)?),
            ValueTag::RefArray => {
                let len = cursor.varint()? as usize;
                let mut refs = Vec::with_capacity(len);
                for _ in 0..len {
                    refs.push(decode_ref(cursor, namespace)?);
                }
                Value::RefArray(refs)
            }
            ValueTag::Json => Value::Json(serde_json::from_str(&cursor.string()?)?),
            ValueTag::GeoPoint => {
                Value::GeoPoint(serde_json::from_str::<GeoPoint>(&cursor.string()?)?)
            }
            ValueTag::GeoPolygon => {
                Value::GeoPolygon(serde_json::from_str::<GeoPolygon>(&cursor.string()?)?)
            }
            ValueTag::GeoLineString => {
                Value::GeoLineString(serde_json::from_str::<GeoLineString>(&cursor.string()?)?)
            }
            ValueTag::Url => Value::Url(EntityUrl::parse(&cursor.string()?)?),
            ValueTag::Vector => {
                let len = cursor.varint()? as usize;
                let mut elements = Vec::with_capacity(len);
                for _ in 0..len {
                    elements.push(cursor.f64()?);
                }
                Value::Vector(elements)
            }
        };
        column.push_back(value);
    }

    Ok(column)
}

fn decode_ref(cursor: &mut Cursor<'_>, namespace: &Namespace) -> Result<EntityUrl, DecodeError> {
    let verbatim = cursor.u8()? != 0;
    let s = cursor.string()?;
    if verbatim {
        Ok(EntityUrl::parse(&s)?)
    } else {
        Ok(EntityUrl::parse(&namespace.rejoin(&s))?)
    }
}
