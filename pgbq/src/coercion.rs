//! Row-level normalization applied before records are staged.
//!
//! Timestamps are rewritten to RFC 3339 text in UTC and JSON-like values are replaced by their
//! JSON text, including inside the objects of record columns. Every other column passes
//! through untouched. A record whose timestamp cannot be
//! interpreted is rejected as a whole rather than staged with a value the warehouse would
//! misread.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::types::{Cell, Record, TargetColumn, TargetType, format_timestamp};

/// Zone-less layouts accepted for timestamp strings, interpreted as UTC.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Zoned layouts besides RFC 3339, as printed by Postgres (`2024-01-01 10:00:00+02`).
const ZONED_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

/// Coerces the values of `record` in place according to `columns`.
///
/// Returns an [`ErrorKind::RowRejected`] error naming the offending column when a timestamp
/// column holds a value that is not a timestamp.
pub fn coerce_record(record: &mut Record, columns: &[TargetColumn]) -> EtlResult<()> {
    for column in columns {
        let Some(cell) = record.get_mut(&column.name) else {
            continue;
        };

        coerce_cell(cell, column)?;
    }

    Ok(())
}

fn coerce_cell(cell: &mut Cell, column: &TargetColumn) -> EtlResult<()> {
    if column.target_type == TargetType::Timestamp {
        coerce_timestamp_cell(cell, column)?;
    }

    if column.target_type == TargetType::Record && !column.fields.is_empty() {
        coerce_record_cell(cell, column)?;
    }

    if column.needs_serialization {
        serialize_cell(cell, column)?;
    }

    Ok(())
}

/// Applies the child columns of a record column to each object it holds.
fn coerce_record_cell(cell: &mut Cell, column: &TargetColumn) -> EtlResult<()> {
    match cell {
        Cell::Json(Value::Array(elements)) if column.is_repeated() => {
            for element in elements.iter_mut() {
                if let Value::Object(object) = element {
                    coerce_object_fields(object, &column.fields)?;
                }
            }
        }
        Cell::Json(Value::Object(object)) => coerce_object_fields(object, &column.fields)?,
        _ => {}
    }

    Ok(())
}

fn coerce_object_fields(object: &mut Map<String, Value>, fields: &[TargetColumn]) -> EtlResult<()> {
    for field in fields {
        let Some(value) = object.get_mut(&field.name) else {
            continue;
        };

        let mut cell = Cell::from(value.clone());
        coerce_cell(&mut cell, field)?;
        *value = cell.to_json();
    }

    Ok(())
}

fn coerce_timestamp_cell(cell: &mut Cell, column: &TargetColumn) -> EtlResult<()> {
    if cell.is_null() {
        return Ok(());
    }

    if column.is_repeated()
        && let Cell::Json(Value::Array(elements)) = cell
    {
        for element in elements.iter_mut() {
            if element.is_null() {
                continue;
            }

            let timestamp = match &*element {
                Value::String(text) => parse_timestamp(text),
                Value::Number(number) => number.as_f64().and_then(epoch_seconds_to_timestamp),
                _ => None,
            };

            match timestamp {
                Some(timestamp) => *element = Value::String(format_timestamp(&timestamp)),
                None => bail!(
                    ErrorKind::RowRejected,
                    "Invalid timestamp value",
                    format!("column `{}` holds `{element}`", column.name)
                ),
            }
        }

        return Ok(());
    }

    let timestamp = match &*cell {
        Cell::Timestamp(value) => Some(value.and_utc()),
        Cell::TimestampTz(value) => Some(*value),
        Cell::String(text) => parse_timestamp(text),
        Cell::I64(seconds) => DateTime::from_timestamp(*seconds, 0),
        Cell::F64(seconds) => epoch_seconds_to_timestamp(*seconds),
        Cell::Null | Cell::Bool(_) | Cell::Json(_) => None,
    };

    match timestamp {
        Some(timestamp) => {
            *cell = Cell::String(format_timestamp(&timestamp));
            Ok(())
        }
        None => bail!(
            ErrorKind::RowRejected,
            "Invalid timestamp value",
            format!("column `{}` holds `{}`", column.name, cell.to_json())
        ),
    }
}

fn serialize_cell(cell: &mut Cell, column: &TargetColumn) -> EtlResult<()> {
    if cell.is_null() {
        return Ok(());
    }

    if column.is_repeated()
        && let Cell::Json(Value::Array(elements)) = cell
    {
        for element in elements.iter_mut() {
            if !element.is_null() {
                *element = Value::String(serde_json::to_string(element)?);
            }
        }

        return Ok(());
    }

    *cell = Cell::String(serde_json::to_string(&cell.to_json())?);

    Ok(())
}

/// Parses the timestamp spellings produced by Postgres and by JSON encoders.
///
/// A bare date is read as midnight UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
        return Some(timestamp.with_timezone(&Utc));
    }

    for format in ZONED_TIMESTAMP_FORMATS {
        if let Ok(timestamp) = DateTime::parse_from_str(text, format) {
            return Some(timestamp.with_timezone(&Utc));
        }
    }

    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(text, format) {
            return Some(timestamp.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|timestamp| timestamp.and_utc())
}

fn epoch_seconds_to_timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }

    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1_000_000_000.0).round() as u32;

    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{ColumnDescriptor, Multiplicity};
    use chrono::NaiveDate;
    use serde_json::json;

    fn columns() -> Vec<TargetColumn> {
        vec![
            TargetColumn::scalar("id", TargetType::Int64),
            TargetColumn::scalar("created_at", TargetType::Timestamp),
            TargetColumn::scalar("payload", TargetType::String).serialized(),
            TargetColumn::scalar("note", TargetType::String),
        ]
    }

    fn is_iso_8601(cell: &Cell) -> bool {
        match cell {
            Cell::Null => true,
            Cell::String(text) => DateTime::parse_from_rfc3339(text).is_ok(),
            _ => false,
        }
    }

    #[test]
    fn test_timestamp_spellings_normalize_to_rfc3339() {
        let naive = NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(8, 15, 0)
            .unwrap();

        let inputs = [
            (Cell::Timestamp(naive), "2024-05-17T08:15:00Z"),
            (Cell::TimestampTz(naive.and_utc()), "2024-05-17T08:15:00Z"),
            (Cell::from("2024-05-17T08:15:00"), "2024-05-17T08:15:00Z"),
            (Cell::from("2024-05-17 08:15:00.5"), "2024-05-17T08:15:00.500Z"),
            (Cell::from("2024-05-17 10:15:00+02"), "2024-05-17T08:15:00Z"),
            (Cell::from("2024-05-17T10:15:00+02:00"), "2024-05-17T08:15:00Z"),
            (Cell::from("2024-05-17"), "2024-05-17T00:00:00Z"),
            (Cell::I64(1_715_933_700), "2024-05-17T08:15:00Z"),
        ];

        for (input, expected) in inputs {
            let mut record = Record::new();
            record.insert("created_at", input.clone());

            coerce_record(&mut record, &columns()).unwrap();

            assert_eq!(
                record.get("created_at"),
                Some(&Cell::from(expected)),
                "coercing {input:?}"
            );
        }
    }

    #[test]
    fn test_coerced_timestamps_are_iso_8601_or_null() {
        let values = [
            json!(null),
            json!("2023-12-31 23:59:59.999999"),
            json!("2023-12-31T23:59:59Z"),
            json!(0),
            json!(1.25),
            json!("not a timestamp"),
            json!(true),
            json!({"nested": 1}),
        ];

        for value in values {
            let mut record = Record::new();
            record.insert("created_at", Cell::from(value));

            match coerce_record(&mut record, &columns()) {
                Ok(()) => assert!(is_iso_8601(record.get("created_at").unwrap())),
                Err(err) => assert_eq!(err.kind(), ErrorKind::RowRejected),
            }
        }
    }

    #[test]
    fn test_invalid_timestamp_rejects_the_row() {
        let mut record = Record::new();
        record.insert("created_at", "yesterday");

        let err = coerce_record(&mut record, &columns()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RowRejected);
        assert!(err.detail().unwrap().contains("created_at"));
    }

    #[test]
    fn test_json_like_values_become_json_text() {
        let mut record = Record::new();
        record.insert("payload", Cell::from(json!({"b": [1, 2], "a": null})));
        record.insert("note", Cell::from(json!({"untouched": true})));

        coerce_record(&mut record, &columns()).unwrap();

        let Some(Cell::String(text)) = record.get("payload") else {
            panic!("payload was not serialized");
        };
        assert_eq!(
            serde_json::from_str::<Value>(text).unwrap(),
            json!({"b": [1, 2], "a": null})
        );
        assert_eq!(record.get("note"), Some(&Cell::Json(json!({"untouched": true}))));
    }

    #[test]
    fn test_scalar_json_strings_are_quoted() {
        let mut record = Record::new();
        record.insert("payload", "plain");
        record.insert("id", 7);

        coerce_record(&mut record, &columns()).unwrap();

        assert_eq!(record.get("payload"), Some(&Cell::from("\"plain\"")));
        assert_eq!(record.get("id"), Some(&Cell::I64(7)));
    }

    #[test]
    fn test_record_array_children_are_coerced() {
        let columns = vec![crate::mapping::map_column(&ColumnDescriptor::new(
            "visits",
            "ARRAY",
            "_record(seen:timestamptz, geo:jsonb, note:text)",
        ))];

        let mut record = Record::new();
        record.insert(
            "visits",
            Cell::from(json!([
                {"seen": "2024-01-01 10:00:00", "geo": {"lat": 1}, "note": "first"},
                {"seen": null, "note": "second"}
            ])),
        );

        coerce_record(&mut record, &columns).unwrap();

        assert_eq!(
            record.get("visits"),
            Some(&Cell::Json(json!([
                {"seen": "2024-01-01T10:00:00Z", "geo": "{\"lat\":1}", "note": "first"},
                {"seen": null, "note": "second"}
            ])))
        );
    }

    #[test]
    fn test_invalid_record_child_timestamp_rejects_the_row() {
        let columns = vec![TargetColumn::record(
            "visits",
            Multiplicity::Repeated,
            vec![TargetColumn::scalar("seen", TargetType::Timestamp)],
        )];

        let mut record = Record::new();
        record.insert("visits", Cell::from(json!([{"seen": "soon"}])));

        let err = coerce_record(&mut record, &columns).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RowRejected);
        assert!(err.detail().unwrap().contains("seen"));
    }

    #[test]
    fn test_repeated_columns_coerce_each_element() {
        let columns = vec![
            TargetColumn::repeated("seen_at", TargetType::Timestamp),
            TargetColumn::repeated("docs", TargetType::String).serialized(),
        ];

        let mut record = Record::new();
        record.insert("seen_at", Cell::from(json!(["2024-01-01 00:00:00", null])));
        record.insert("docs", Cell::from(json!([{"k": 1}, null])));

        coerce_record(&mut record, &columns).unwrap();

        assert_eq!(
            record.get("seen_at"),
            Some(&Cell::Json(json!(["2024-01-01T00:00:00Z", null])))
        );
        assert_eq!(
            record.get("docs"),
            Some(&Cell::Json(json!(["{\"k\":1}", null])))
        );
    }

    #[test]
    fn test_missing_columns_are_ignored() {
        let mut record = Record::new();
        record.insert("id", 1);

        coerce_record(&mut record, &columns()).unwrap();
        assert_eq!(record.len(), 1);
    }
}
