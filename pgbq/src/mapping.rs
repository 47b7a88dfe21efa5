//! Translation of Postgres column metadata into warehouse columns.
//!
//! The mapping is a pure function of the [`ColumnDescriptor`]. Declared types are matched by
//! case-insensitive prefix, so parameterized forms such as `character varying(64)` or
//! `timestamp(3) with time zone` map like their base type. Anything unrecognized becomes a
//! `STRING` column so loading keeps going.

use tracing::warn;

use crate::types::{ColumnDescriptor, Multiplicity, TargetColumn, TargetType};

/// Declared type of every Postgres array column in `information_schema.columns`.
const ARRAY_DATA_TYPE: &str = "array";

/// Element tag fragment identifying composite (record) arrays.
const RECORD_TAG: &str = "record";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapped {
    Plain(TargetType),
    /// JSON-like values, stored as their serialized text.
    Serialized,
}

/// Prefix rules, first match wins. `interval` must precede `int` and `timestamp` must precede
/// `time`.
const PREFIX_RULES: &[(&str, Mapped)] = &[
    ("interval", Mapped::Plain(TargetType::String)),
    ("int", Mapped::Plain(TargetType::Int64)),
    ("serial", Mapped::Plain(TargetType::Int64)),
    ("bigserial", Mapped::Plain(TargetType::Int64)),
    ("bigint", Mapped::Plain(TargetType::Int64)),
    ("smallint", Mapped::Plain(TargetType::Int64)),
    ("smallserial", Mapped::Plain(TargetType::Int64)),
    ("numeric", Mapped::Plain(TargetType::Numeric)),
    ("decimal", Mapped::Plain(TargetType::Numeric)),
    ("float", Mapped::Plain(TargetType::Float64)),
    ("double", Mapped::Plain(TargetType::Float64)),
    ("real", Mapped::Plain(TargetType::Float64)),
    ("bool", Mapped::Plain(TargetType::Bool)),
    ("json", Mapped::Serialized),
    ("character", Mapped::Plain(TargetType::String)),
    ("char", Mapped::Plain(TargetType::String)),
    ("bpchar", Mapped::Plain(TargetType::String)),
    ("varchar", Mapped::Plain(TargetType::String)),
    ("text", Mapped::Plain(TargetType::String)),
    ("citext", Mapped::Plain(TargetType::String)),
    ("date", Mapped::Plain(TargetType::Date)),
    ("timestamp", Mapped::Plain(TargetType::Timestamp)),
    ("time", Mapped::Plain(TargetType::Time)),
    ("bytea", Mapped::Plain(TargetType::Bytes)),
    ("blob", Mapped::Plain(TargetType::Bytes)),
];

/// Maps a source column to its warehouse column.
///
/// Array columns (`data_type` = `ARRAY`) become repeated columns whose element type comes
/// from `udt_name`. Arrays of records decompose a `record(name:type, ...)` tag into child
/// columns; this is best effort and pairs that do not parse are skipped.
pub fn map_column(descriptor: &ColumnDescriptor) -> TargetColumn {
    if descriptor.data_type.eq_ignore_ascii_case(ARRAY_DATA_TYPE) {
        return map_array(&descriptor.name, &descriptor.udt_name);
    }

    scalar_column(&descriptor.name, map_type_name(&descriptor.data_type), Multiplicity::Scalar)
}

fn map_type_name(type_name: &str) -> Mapped {
    let type_name = type_name.trim().to_lowercase();

    PREFIX_RULES
        .iter()
        .find(|(prefix, _)| type_name.starts_with(prefix))
        .map(|(_, mapped)| *mapped)
        .unwrap_or(Mapped::Plain(TargetType::String))
}

fn scalar_column(name: &str, mapped: Mapped, multiplicity: Multiplicity) -> TargetColumn {
    let column = match mapped {
        Mapped::Plain(target_type) => TargetColumn::scalar(name, target_type),
        Mapped::Serialized => TargetColumn::scalar(name, TargetType::String).serialized(),
    };

    TargetColumn {
        multiplicity,
        ..column
    }
}

fn map_array(name: &str, udt_name: &str) -> TargetColumn {
    let tag = udt_name.trim().to_lowercase();
    let element = tag.strip_prefix('_').unwrap_or(&tag);
    let element = element.strip_suffix("[]").unwrap_or(element);

    if element.contains(RECORD_TAG) {
        let fields = parse_record_fields(name, element);
        if fields.is_empty() {
            warn!(
                column = name,
                udt_name, "record array without parsable fields, storing elements as json text"
            );
            return TargetColumn::repeated(name, TargetType::String).serialized();
        }

        return TargetColumn::record(name, Multiplicity::Repeated, fields);
    }

    scalar_column(name, map_type_name(element), Multiplicity::Repeated)
}

/// Parses the `name:type` pairs between the outermost parentheses of a record tag.
fn parse_record_fields(column: &str, tag: &str) -> Vec<TargetColumn> {
    let (Some(open), Some(close)) = (tag.find('('), tag.rfind(')')) else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }

    tag[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| match pair.split_once(':') {
            Some((field, field_type)) if !field.trim().is_empty() => Some(scalar_column(
                field.trim(),
                map_type_name(field_type),
                Multiplicity::Scalar,
            )),
            _ => {
                warn!(column, pair, "skipping malformed record field");
                None
            }
        })
        .collect()
}
