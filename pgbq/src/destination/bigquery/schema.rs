//! Conversion between [`TargetColumn`]s and GoogleSQL type declarations.

use std::time::Duration;

use crate::destination::sanitize_identifier;
use crate::error::EtlResult;
use crate::types::{Multiplicity, TargetColumn, TargetType};

/// Renders the type of `column` for a `CREATE TABLE` statement.
pub fn column_type_spec(column: &TargetColumn) -> EtlResult<String> {
    let element = match column.target_type {
        TargetType::Record => {
            let fields = column
                .fields
                .iter()
                .map(column_spec)
                .collect::<EtlResult<Vec<_>>>()?;
            format!("struct<{}>", fields.join(", "))
        }
        target_type => target_type.as_str().to_lowercase(),
    };

    Ok(match column.multiplicity {
        Multiplicity::Scalar => element,
        Multiplicity::Repeated => format!("array<{element}>"),
    })
}

/// Renders `` `name` type `` for `column`.
pub fn column_spec(column: &TargetColumn) -> EtlResult<String> {
    let name = sanitize_identifier(&column.name, "BigQuery column name")?;

    Ok(format!("`{name}` {}", column_type_spec(column)?))
}

/// Renders the parenthesized column list of a `CREATE TABLE` statement.
pub fn create_columns_spec(columns: &[TargetColumn]) -> EtlResult<String> {
    let specs = columns
        .iter()
        .map(column_spec)
        .collect::<EtlResult<Vec<_>>>()?;

    Ok(format!("({})", specs.join(", ")))
}

/// Renders the table option making the table expire `expiration` after the statement runs.
///
/// Expirations are rounded up to whole minutes.
pub fn expiration_option(expiration: Duration) -> String {
    let minutes = expiration.as_secs().div_ceil(60).max(1);

    format!(
        "options(expiration_timestamp = timestamp_add(current_timestamp(), interval {minutes} minute))"
    )
}

/// Parses a `data_type` as reported by `INFORMATION_SCHEMA.COLUMNS`.
///
/// Type parameters are dropped (`NUMERIC(10, 2)` is `NUMERIC`). Types outside the supported
/// set, such as `DATETIME`, `JSON` or `GEOGRAPHY`, are read as `STRING`, matching how values
/// are sent to them.
pub fn parse_column_type(name: &str, data_type: &str) -> TargetColumn {
    let data_type = data_type.trim();

    if let Some(inner) = strip_wrapper(data_type, "ARRAY") {
        let element = parse_column_type(name, inner);
        return TargetColumn {
            multiplicity: Multiplicity::Repeated,
            ..element
        };
    }

    if let Some(inner) = strip_wrapper(data_type, "STRUCT") {
        let fields = split_top_level(inner)
            .into_iter()
            .filter_map(|field| {
                let (field_name, field_type) = field.trim().split_once(char::is_whitespace)?;
                Some(parse_column_type(field_name.trim_matches('`'), field_type))
            })
            .collect();

        return TargetColumn::record(name, Multiplicity::Scalar, fields);
    }

    let base = data_type
        .split('(')
        .next()
        .unwrap_or(data_type)
        .trim()
        .to_ascii_uppercase();

    let target_type = match base.as_str() {
        "INT64" | "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "BYTEINT" => {
            TargetType::Int64
        }
        "NUMERIC" | "DECIMAL" | "BIGNUMERIC" | "BIGDECIMAL" => TargetType::Numeric,
        "FLOAT64" | "FLOAT" => TargetType::Float64,
        "BOOL" | "BOOLEAN" => TargetType::Bool,
        "DATE" => TargetType::Date,
        "TIME" => TargetType::Time,
        "TIMESTAMP" => TargetType::Timestamp,
        "BYTES" => TargetType::Bytes,
        _ => TargetType::String,
    };

    TargetColumn::scalar(name, target_type)
}

/// Returns the text between `<` and the final `>` when `data_type` is `KEYWORD<...>`.
fn strip_wrapper<'a>(data_type: &'a str, keyword: &str) -> Option<&'a str> {
    let head = data_type.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }

    data_type[keyword.len()..]
        .trim_start()
        .strip_prefix('<')?
        .strip_suffix('>')
}

/// Splits on commas that are not nested inside `<>` or `()`.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (index, ch) in list.char_indices() {
        match ch {
            '<' | '(' => depth += 1,
            '>' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&list[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }

    if !list[start..].trim().is_empty() {
        parts.push(&list[start..]);
    }

    parts
}
