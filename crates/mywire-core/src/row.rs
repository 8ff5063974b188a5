//! Result row representation.

use std::collections::HashMap;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::value::Value;

/// A single row returned from a query.
///
/// Values are keyed by column name and kept in declared column order.
/// Inserting a name that is already present replaces the earlier value
/// in place, so a result with duplicate column names keeps the last one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    entries: Vec<(String, Value)>,
    /// Name -> position in `entries`
    index: HashMap<String, usize>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty row with room for `columns` values.
    pub fn with_capacity(columns: usize) -> Self {
        Self {
            entries: Vec::with_capacity(columns),
            index: HashMap::with_capacity(columns),
        }
    }

    /// Set the value for a column, overwriting any earlier value of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(&pos) = self.index.get(&name) {
            self.entries[pos].1 = value;
        } else {
            self.index.insert(name.clone(), self.entries.len());
            self.entries.push((name, value));
        }
    }

    /// Number of distinct columns in this row.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the row has no values.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get a value by column name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index.get(name).map(|&pos| &self.entries[pos].1)
    }

    /// Get a value by position.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.entries.get(index).map(|(_, v)| v)
    }

    /// Check if a column exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Iterate over `(name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = (&'a str, &'a Value);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, Value)>,
        fn(&'a (String, Value)) -> (&'a str, &'a Value),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter().map(entry_ref as fn(&'a (String, Value)) -> (&'a str, &'a Value))
    }
}

fn entry_ref((name, value): &(String, Value)) -> (&str, &Value) {
    (name.as_str(), value)
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            row.insert(name, value);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
