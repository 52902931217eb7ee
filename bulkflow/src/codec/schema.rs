//! Column schemas for warehouse ingestion.
//!
//! A schema declares each column as one of five warehouse types. It is
//! inferred from a batch, sent on job creation, and used to rebuild typed
//! rows from delimited text.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::delimited::{parse, DelimitedError, DelimitedOptions};
use crate::model::{Batch, FieldValue, Row};

/// Warehouse column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// 64-bit integer.
    Bigint,
    /// 64-bit float.
    Double,
    /// Text.
    String,
    /// Boolean.
    Boolean,
    /// UTC timestamp.
    Timestamp,
}

impl FieldType {
    const fn of(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Null => None,
            FieldValue::Bool(_) => Some(Self::Boolean),
            FieldValue::Integer(_) => Some(Self::Bigint),
            FieldValue::Float(_) => Some(Self::Double),
            FieldValue::Timestamp(_) => Some(Self::Timestamp),
            FieldValue::Text(_) => Some(Self::String),
        }
    }

    fn widen(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Bigint | Self::Double, Self::Bigint | Self::Double) => Self::Double,
            _ => Self::String,
        }
    }

    fn decode(self, text: &str) -> Option<FieldValue> {
        match self {
            Self::Bigint => text.parse().ok().map(FieldValue::Integer),
            Self::Double => text.parse().ok().map(FieldValue::Float),
            Self::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" => Some(FieldValue::Bool(true)),
                "false" => Some(FieldValue::Bool(false)),
                _ => None,
            },
            Self::Timestamp => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| FieldValue::Timestamp(ts.with_timezone(&Utc))),
            Self::String => Some(FieldValue::Text(text.to_string())),
        }
    }
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Column name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Ordered column declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Columns in header order.
    pub fields: Vec<SchemaField>,
}

impl Schema {
    /// Infers a type for every header column from its non-null values.
    ///
    /// Bigint and Double widen to Double; any other mix, and a column with
    /// no values at all, is String.
    #[must_use]
    pub fn infer(batch: &Batch) -> Self {
        let fields = batch
            .header()
            .into_iter()
            .map(|name| {
                let field_type = batch
                    .rows()
                    .iter()
                    .filter_map(|row| row.get(&name).and_then(FieldType::of))
                    .reduce(FieldType::widen)
                    .unwrap_or(FieldType::String);
                SchemaField { name, field_type }
            })
            .collect();
        Self { fields }
    }

    /// Looks up a column's type.
    #[must_use]
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.field_type)
    }
}

/// Failure to rebuild typed rows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypedParseError {
    /// The text itself is malformed.
    #[error(transparent)]
    Delimited(#[from] DelimitedError),

    /// The header does not match the schema.
    #[error("header {found:?} does not match schema columns {expected:?}")]
    HeaderMismatch {
        /// Schema column names.
        expected: Vec<String>,
        /// Parsed header.
        found: Vec<String>,
    },

    /// A cell does not parse as its column's type.
    #[error("row {row}, column `{column}`: {value:?} is not a valid {field_type:?}")]
    InvalidValue {
        /// Zero-based data row.
        row: usize,
        /// Column name.
        column: String,
        /// The offending text.
        value: String,
        /// Declared type.
        field_type: FieldType,
    },
}

/// Parses delimited text into typed rows according to `schema`.
pub fn parse_typed(
    bytes: &[u8],
    schema: &Schema,
    options: &DelimitedOptions,
) -> Result<Batch, TypedParseError> {
    let table = parse(bytes, options)?;
    let expected: Vec<String> = schema.fields.iter().map(|f| f.name.clone()).collect();
    if table.header != expected {
        return Err(TypedParseError::HeaderMismatch {
            expected,
            found: table.header,
        });
    }

    let mut batch = Batch::default();
    for (index, cells) in table.rows.into_iter().enumerate() {
        let mut row = Row::new();
        for (field, cell) in schema.fields.iter().zip(cells) {
            let value = match cell {
                None => FieldValue::Null,
                Some(text) => field.field_type.decode(&text).ok_or_else(|| {
                    TypedParseError::InvalidValue {
                        row: index,
                        column: field.name.clone(),
                        value: text.clone(),
                        field_type: field.field_type,
                    }
                })?,
            };
            row.insert(field.name.clone(), value);
        }
        batch.push(row);
    }
    Ok(batch)
}

#[allow(clippy::expect_used)]
fn non_word_runs() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\s\W]+").expect("column pattern is valid"))
}

/// Lowercases a column name and collapses runs of whitespace and
/// non-word characters into `_`.
#[must_use]
pub fn normalize_column_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    non_word_runs().replace_all(&lowered, "_").into_owned()
}
