use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

/// A single value of a [`crate::types::Record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    /// Timestamp without zone, interpreted as UTC when written.
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    /// Arrays and objects, kept as their JSON structure.
    Json(Value),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Returns the JSON representation sent to the warehouse.
    ///
    /// Timestamps render as RFC 3339 in UTC. Non-finite floats have no JSON form and become
    /// null.
    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(value) => Value::Bool(*value),
            Cell::I64(value) => Value::Number((*value).into()),
            Cell::F64(value) => Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::String(value) => Value::String(value.clone()),
            Cell::Timestamp(value) => Value::String(format_timestamp(&value.and_utc())),
            Cell::TimestampTz(value) => Value::String(format_timestamp(value)),
            Cell::Json(value) => value.clone(),
        }
    }
}

impl From<Value> for Cell {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(value) => Cell::Bool(value),
            Value::Number(number) => match number.as_i64() {
                Some(value) => Cell::I64(value),
                None => number.as_f64().map(Cell::F64).unwrap_or(Cell::Null),
            },
            Value::String(value) => Cell::String(value),
            value @ (Value::Array(_) | Value::Object(_)) => Cell::Json(value),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::String(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::String(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::I64(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::F64(value)
    }
}

/// Canonical text form of timestamps: RFC 3339, UTC, `Z` suffix, fraction only when present.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
