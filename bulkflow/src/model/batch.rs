//! Rows and batches of scalar values.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::schema::normalize_column_name;
use crate::errors::InputValidationError;

/// A single scalar cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// Text.
    Text(String),
}

impl FieldValue {
    /// Whether the value is [`FieldValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Renders the value as wire text. `Null` renders as `None`.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::Text(s) => Some(s.clone()),
        }
    }

    /// The value as a correlation key. Null and empty text have no key.
    #[must_use]
    pub fn as_key(&self) -> Option<String> {
        match self {
            Self::Text(s) if s.is_empty() => None,
            other => other.render(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// An ordered mapping of field name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: Vec<(String, FieldValue)>,
}

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Row::insert`].
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    /// Sets a field, keeping its position if it already exists.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        let field = field.into();
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(name, _)| *name == field) {
            slot.1 = value;
        } else {
            self.fields.push((field, value));
        }
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Iterates over `(field, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the row has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Row
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Self::new();
        for (field, value) in iter {
            row.insert(field, value);
        }
        row
    }
}

/// An ordered sequence of rows submitted as one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    rows: Vec<Row>,
}

impl Batch {
    /// Creates a batch from rows.
    #[must_use]
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Appends a row.
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// The rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names, taken from the first row.
    #[must_use]
    pub fn header(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|row| row.field_names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Checks the batch against a correlation key and returns the key values in row order.
    ///
    /// Every row must carry the key with a non-null value that is unique in
    /// the batch, and no row may carry a field the header lacks.
    pub fn validate(&self, correlation_key: &str) -> Result<Vec<String>, InputValidationError> {
        if self.rows.is_empty() {
            return Err(InputValidationError::EmptyBatch);
        }

        let header = self.header();
        let known: HashSet<&str> = header.iter().map(String::as_str).collect();
        let mut seen: HashMap<String, usize> = HashMap::with_capacity(self.rows.len());
        let mut keys = Vec::with_capacity(self.rows.len());

        for (index, row) in self.rows.iter().enumerate() {
            if let Some(field) = row.field_names().find(|name| !known.contains(name)) {
                return Err(InputValidationError::UnknownField {
                    row: index,
                    field: field.to_string(),
                });
            }

            let value = row
                .get(correlation_key)
                .ok_or_else(|| InputValidationError::MissingKey {
                    row: index,
                    key: correlation_key.to_string(),
                })?;
            let key = value.as_key().ok_or_else(|| InputValidationError::NullKey {
                row: index,
                key: correlation_key.to_string(),
            })?;

            if let Some(&first_row) = seen.get(&key) {
                return Err(InputValidationError::DuplicateKey {
                    value: key,
                    first_row,
                    row: index,
                });
            }
            seen.insert(key.clone(), index);
            keys.push(key);
        }

        Ok(keys)
    }

    /// Splits the batch into consecutive batches of at most `size` rows.
    #[must_use]
    pub fn chunks(&self, size: usize) -> Vec<Self> {
        self.rows
            .chunks(size.max(1))
            .map(|rows| Self::new(rows.to_vec()))
            .collect()
    }

    /// Rewrites every column name into its warehouse-friendly form.
    pub fn with_normalized_columns(&self) -> Result<Self, InputValidationError> {
        let mut renamed: HashMap<String, String> = HashMap::new();
        let mut owners: HashMap<String, String> = HashMap::new();
        for name in self.header() {
            let normalized = normalize_column_name(&name);
            if let Some(first) = owners.get(&normalized) {
                return Err(InputValidationError::ColumnCollision {
                    first: first.clone(),
                    second: name,
                    normalized,
                });
            }
            owners.insert(normalized.clone(), name.clone());
            renamed.insert(name, normalized);
        }

        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(name, value)| {
                        let column = renamed
                            .get(name)
                            .cloned()
                            .unwrap_or_else(|| normalize_column_name(name));
                        (column, value.clone())
                    })
                    .collect()
            })
            .collect();
        Ok(Self::new(rows))
    }
}

impl FromIterator<Row> for Batch {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl From<Vec<Row>> for Batch {
    fn from(rows: Vec<Row>) -> Self {
        Self::new(rows)
    }
}
