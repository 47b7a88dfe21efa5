use std::fmt;

/// Column types of the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetType {
    Int64,
    Numeric,
    Float64,
    Bool,
    String,
    Date,
    Time,
    Timestamp,
    Bytes,
    /// Structured column whose children are listed in [`TargetColumn::fields`].
    Record,
}

impl TargetType {
    /// Returns the GoogleSQL name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Int64 => "INT64",
            TargetType::Numeric => "NUMERIC",
            TargetType::Float64 => "FLOAT64",
            TargetType::Bool => "BOOL",
            TargetType::String => "STRING",
            TargetType::Date => "DATE",
            TargetType::Time => "TIME",
            TargetType::Timestamp => "TIMESTAMP",
            TargetType::Bytes => "BYTES",
            TargetType::Record => "RECORD",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a column holds one value or a list of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Multiplicity {
    Scalar,
    Repeated,
}

/// A warehouse column derived from a source column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetColumn {
    pub name: String,
    pub target_type: TargetType,
    pub multiplicity: Multiplicity,
    /// Values are semi-structured and must be written as their JSON text.
    pub needs_serialization: bool,
    /// Children of a [`TargetType::Record`] column, empty otherwise.
    pub fields: Vec<TargetColumn>,
}

impl TargetColumn {
    pub fn scalar(name: impl Into<String>, target_type: TargetType) -> TargetColumn {
        Self {
            name: name.into(),
            target_type,
            multiplicity: Multiplicity::Scalar,
            needs_serialization: false,
            fields: Vec::new(),
        }
    }

    pub fn repeated(name: impl Into<String>, target_type: TargetType) -> TargetColumn {
        Self {
            multiplicity: Multiplicity::Repeated,
            ..Self::scalar(name, target_type)
        }
    }

    /// Builds a [`TargetType::Record`] column with the given children.
    pub fn record(
        name: impl Into<String>,
        multiplicity: Multiplicity,
        fields: Vec<TargetColumn>,
    ) -> TargetColumn {
        Self {
            multiplicity,
            fields,
            ..Self::scalar(name, TargetType::Record)
        }
    }

    /// Marks the column as holding JSON-like values.
    pub fn serialized(mut self) -> TargetColumn {
        self.needs_serialization = true;
        self
    }

    pub fn is_repeated(&self) -> bool {
        self.multiplicity == Multiplicity::Repeated
    }
}
