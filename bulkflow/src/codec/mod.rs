//! Wire encodings: delimited-text payloads and warehouse column schemas.

pub mod delimited;
pub mod schema;

pub use delimited::{
    parse, payload_checksum, serialize, DelimitedError, DelimitedOptions, LineEnding, Payload,
    Table,
};
pub use schema::{normalize_column_name, parse_typed, FieldType, Schema, SchemaField, TypedParseError};
