//! The triple record and MVCC resolution over collections of triples.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::ident::{EntityUrl, Predicate};
use crate::ulid::Ulid;
use crate::value::{Value, ValueError};

#[derive(Debug, PartialEq, Error)]
pub enum TripleError {
    #[error("timestamp must be strictly positive")]
    ZeroTimestamp,
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// The atomic record: who, what, which value, when, and under which
/// transaction.
///
/// Triples are immutable. An update is a new triple with a later
/// timestamp; a delete is a [Value::Null] tombstone. The newest triple per
/// `(subject, predicate)` wins.
#[derive(Clone, Debug, PartialEq)]
pub struct Triple {
    pub subject: EntityUrl,
    pub predicate: Predicate,
    pub object: Value,
    /// Milliseconds since epoch, strictly positive.
    pub timestamp: u64,
    pub tx_id: Ulid,
}

impl Triple {
    pub fn new(
        subject: EntityUrl,
        predicate: Predicate,
        object: Value,
        timestamp: u64,
        tx_id: Ulid,
    ) -> Result<Self, TripleError> {
        if timestamp == 0 {
            return Err(TripleError::ZeroTimestamp);
        }
        object.validate()?;
        Ok(Self {
            subject,
            predicate,
            object,
            timestamp,
            tx_id,
        })
    }
}

/// Resolves the newest triple per `(subject, predicate)`, ordered by
/// `(timestamp, tx_id)`. Tombstones are kept: callers that materialize an
/// entity view must drop them (see [current_value]).
pub fn latest<'a, I>(triples: I) -> BTreeMap<(&'a str, &'a str), &'a Triple>
where
    I: IntoIterator<Item = &'a Triple>,
{
    let mut resolved: BTreeMap<(&str, &str), &Triple> = BTreeMap::new();
    for triple in triples {
        let key = (triple.subject.as_str(), triple.predicate.as_str());
        match resolved.get(&key) {
            Some(current)
                if (current.timestamp, current.tx_id) >= (triple.timestamp, triple.tx_id) => {}
            _ => {
                resolved.insert(key, triple);
            }
        }
    }
    resolved
}

/// The current value of `(subject, predicate)`, or [None] when it was
/// never written or its newest version is a tombstone.
pub fn current_value<'a, I>(triples: I, subject: &str, predicate: &str) -> Option<&'a Value>
where
    I: IntoIterator<Item = &'a Triple>,
{
    latest(triples)
        .get(&(subject, predicate))
        .filter(|t| !t.object.is_tombstone())
        .map(|t| &t.object)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(subject: &str, predicate: &str, object: Value, ts: u64, tx: &str) -> Triple {
        Triple::new(
            EntityUrl::parse(subject).unwrap(),
            Predicate::parse(predicate).unwrap(),
            object,
            ts,
            tx.parse().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_timestamp() {
        let result = Triple::new(
            EntityUrl::parse("https://example.com/a").unwrap(),
            Predicate::parse("name").unwrap(),
            Value::Null,
            0,
            "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap(),
        );
        assert_eq!(Err(TripleError::ZeroTimestamp), result);
    }

    #[test]
    fn newest_timestamp_wins() {
        let triples = vec![
            triple(
                "https://example.com/a",
                "name",
                Value::String("old".into()),
                100,
                "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            ),
            triple(
                "https://example.com/a",
                "name",
                Value::String("new".into()),
                200,
                "01ARZ3NDEKTSV4RRFFQ69G5FAW",
            ),
        ];
        assert_eq!(
            Some(&Value::String("new".into())),
            current_value(&triples, "https://example.com/a", "name")
        );
    }

    #[test]
    fn tx_id_breaks_timestamp_ties() {
        let triples = vec![
            triple(
                "https://example.com/a",
                "name",
                Value::String("second".into()),
                100,
                "01ARZ3NDEKTSV4RRFFQ69G5FAW",
            ),
            triple(
                "https://example.com/a",
                "name",
                Value::String("first".into()),
                100,
                "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            ),
        ];
        let resolved = latest(&triples);
        assert_eq!(
            &Value::String("second".into()),
            &resolved[&("https://example.com/a", "name")].object
        );
    }

    #[test]
    fn tombstone_hides_earlier_value() {
        // Insert, then delete at a later timestamp: the latest triple is
        // the tombstone, and materialized reads see nothing.
        let triples = vec![
            triple(
                "https://example.com/a",
                "name",
                Value::String("v1".into()),
                100,
                "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            ),
            triple(
                "https://example.com/a",
                "name",
                Value::Null,
                200,
                "01ARZ3NDEKTSV4RRFFQ69G5FAW",
            ),
        ];

        let resolved = latest(&triples);
        assert!(resolved[&("https://example.com/a", "name")]
            .object
            .is_tombstone());
        assert_eq!(
            None,
            current_value(&triples, "https://example.com/a", "name")
        );
    }

    #[test]
    fn pairs_resolve_independently() {
        let triples = vec![
            triple(
                "https://example.com/a",
                "name",
                Value::Null,
                300,
                "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            ),
            triple(
                "https://example.com/a",
                "age",
                Value::Int64(30),
                100,
                "01ARZ3NDEKTSV4RRFFQ69G5FAW",
            ),
        ];
        assert_eq!(
            None,
            current_value(&triples, "https://example.com/a", "name")
        );
        assert_eq!(
            Some(&Value::Int64(30)),
            current_value(&triples, "https://example.com/a", "age")
        );
    }
}
