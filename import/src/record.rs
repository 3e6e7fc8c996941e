//! Source record formats.

use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// One JSON object per line.
    Ndjson,
    /// Tab-separated positional columns.
    Tsv,
}

/// One parsed source line.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Json(serde_json::Value),
    Row(Vec<String>),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("NDJSON line is not an object")]
    NotAnObject,
}

/// Parses one line according to `format`. Malformed lines are the
/// caller's business to count and skip.
pub fn parse_line(format: RecordFormat, line: &str) -> Result<Record, RecordError> {
    match format {
        RecordFormat::Ndjson => {
            let value: serde_json::Value = serde_json::from_str(line)?;
            if !value.is_object() {
                return Err(RecordError::NotAnObject);
            }
            Ok(Record::Json(value))
        }
        RecordFormat::Tsv => Ok(Record::Row(
            line.split('\t').map(str::to_string).collect(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ndjson_objects_parse() {
        let record = parse_line(RecordFormat::Ndjson, r#"{"id":1,"word":"w_1"}"#).unwrap();
        assert_eq!(Record::Json(json!({"id": 1, "word": "w_1"})), record);
    }

    #[test]
    fn ndjson_rejects_non_objects() {
        assert!(matches!(
            parse_line(RecordFormat::Ndjson, "[1,2,3]"),
            Err(RecordError::NotAnObject)
        ));
        assert!(matches!(
            parse_line(RecordFormat::Ndjson, "not json"),
            Err(RecordError::Json(_))
        ));
    }

    #[test]
    fn tsv_splits_positionally() {
        let record = parse_line(RecordFormat::Tsv, "1\tw_1\tnoun").unwrap();
        assert_eq!(
            Record::Row(vec!["1".into(), "w_1".into(), "noun".into()]),
            record
        );
    }

    #[test]
    fn tsv_keeps_empty_columns() {
        let record = parse_line(RecordFormat::Tsv, "a\t\tc").unwrap();
        assert_eq!(Record::Row(vec!["a".into(), "".into(), "c".into()]), record);
    }
}
