use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::types::Cell;

/// A source row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: BTreeMap<String, Cell>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.values.get(column)
    }

    pub fn get_mut(&mut self, column: &str) -> Option<&mut Cell> {
        self.values.get_mut(column)
    }

    /// Sets `column`, returning the previous value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Cell>) -> Option<Cell> {
        self.values.insert(column.into(), value.into())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.values.iter().map(|(name, cell)| (name.as_str(), cell))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keeps only the columns accepted by `keep`, returning the names of the dropped ones.
    pub fn retain_columns<F>(&mut self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str) -> bool,
    {
        let dropped: Vec<String> = self
            .values
            .keys()
            .filter(|name| !keep(name))
            .cloned()
            .collect();

        for name in &dropped {
            self.values.remove(name);
        }

        dropped
    }

    /// Returns the row as the JSON object written to the warehouse.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(name, cell)| (name.clone(), cell.to_json()))
                .collect(),
        )
    }
}

impl From<Map<String, Value>> for Record {
    fn from(object: Map<String, Value>) -> Self {
        object
            .into_iter()
            .map(|(name, value)| (name, Cell::from(value)))
            .collect()
    }
}

impl FromIterator<(String, Cell)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Cell)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
