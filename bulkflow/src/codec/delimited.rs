//! Delimited-text payloads with RFC 4180 quoting.
//!
//! Fields containing the delimiter, a quote, CR or LF are quoted, and quotes
//! inside them are doubled. A null value is written as the bare null token;
//! an empty string is written as `""` so the two stay distinguishable.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::InputValidationError;
use crate::model::{Batch, ContentFormat};

const QUOTE: char = '"';
const BOM: char = '\u{feff}';

/// Record terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LineEnding {
    /// `\n`
    #[default]
    Lf,
    /// `\r\n`
    Crlf,
}

impl LineEnding {
    /// The terminator characters.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::Crlf => "\r\n",
        }
    }

    /// The `lineEnding` value sent on job creation.
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::Lf => "LF",
            Self::Crlf => "CRLF",
        }
    }
}

fn default_delimiter() -> char {
    ','
}

/// Formatting options for delimited text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelimitedOptions {
    /// Column separator.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Record terminator.
    #[serde(default)]
    pub line_ending: LineEnding,
    /// Text written for null values.
    #[serde(default)]
    pub null_token: String,
}

impl Default for DelimitedOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            line_ending: LineEnding::Lf,
            null_token: String::new(),
        }
    }
}

impl DelimitedOptions {
    /// Sets the delimiter.
    #[must_use]
    pub const fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Sets the line ending.
    #[must_use]
    pub const fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    /// Sets the null token.
    #[must_use]
    pub fn with_null_token(mut self, token: impl Into<String>) -> Self {
        self.null_token = token.into();
        self
    }

    /// The `columnDelimiter` value sent on job creation.
    #[must_use]
    pub const fn wire_delimiter_name(&self) -> Option<&'static str> {
        match self.delimiter {
            ',' => Some("COMMA"),
            '\t' => Some("TAB"),
            ';' => Some("SEMICOLON"),
            '|' => Some("PIPE"),
            '^' => Some("CARET"),
            '`' => Some("BACKQUOTE"),
            _ => None,
        }
    }

    /// Rejects delimiters the service does not accept, and null tokens that
    /// could not be told apart from data.
    pub fn validate(&self) -> Result<(), InputValidationError> {
        if self.wire_delimiter_name().is_none() {
            return Err(InputValidationError::InvalidDelimiter(self.delimiter));
        }
        if self
            .null_token
            .chars()
            .any(|c| c == self.delimiter || c == QUOTE || c == '\r' || c == '\n')
        {
            return Err(InputValidationError::InvalidDescriptor(format!(
                "null token {:?} contains a reserved character",
                self.null_token
            )));
        }
        Ok(())
    }

    fn needs_quoting(&self, text: &str) -> bool {
        text.is_empty()
            || (!self.null_token.is_empty() && text == self.null_token)
            || text
                .chars()
                .any(|c| c == self.delimiter || c == QUOTE || c == '\r' || c == '\n')
    }

    fn write_field(&self, out: &mut String, value: Option<&str>) {
        match value {
            None => out.push_str(&self.null_token),
            Some(text) if self.needs_quoting(text) => {
                out.push(QUOTE);
                for c in text.chars() {
                    if c == QUOTE {
                        out.push(QUOTE);
                    }
                    out.push(c);
                }
                out.push(QUOTE);
            }
            Some(text) => out.push_str(text),
        }
    }

    fn write_record<'a>(&self, out: &mut String, fields: impl IntoIterator<Item = Option<&'a str>>) {
        for (index, field) in fields.into_iter().enumerate() {
            if index > 0 {
                out.push(self.delimiter);
            }
            self.write_field(out, field);
        }
        out.push_str(self.line_ending.as_str());
    }
}

/// Serializes a batch: a header from the first row's fields, then one line per row.
///
/// Output is deterministic for a given batch and options.
pub fn serialize(
    batch: &Batch,
    format: ContentFormat,
    options: &DelimitedOptions,
) -> Result<Vec<u8>, InputValidationError> {
    let ContentFormat::DelimitedText = format;
    options.validate()?;
    if batch.is_empty() {
        return Err(InputValidationError::EmptyBatch);
    }

    let header = batch.header();
    let known: HashSet<&str> = header.iter().map(String::as_str).collect();
    let mut out = String::new();
    options.write_record(&mut out, header.iter().map(|name| Some(name.as_str())));

    for (index, row) in batch.rows().iter().enumerate() {
        if let Some(field) = row.field_names().find(|name| !known.contains(name)) {
            return Err(InputValidationError::UnknownField {
                row: index,
                field: field.to_string(),
            });
        }
        let cells: Vec<Option<String>> = header
            .iter()
            .map(|name| row.get(name).and_then(crate::model::FieldValue::render))
            .collect();
        options.write_record(&mut out, cells.iter().map(Option::as_deref));
    }

    Ok(out.into_bytes())
}

/// A parse failure, with the 1-based line the offending record starts on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct DelimitedError {
    /// Line number.
    pub line: usize,
    /// What went wrong.
    pub message: String,
}

/// Header plus string cells. `None` cells were the unquoted null token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    /// Column names.
    pub header: Vec<String>,
    /// Data rows, each as long as the header.
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    /// Creates an empty table with the given columns.
    #[must_use]
    pub fn new<S: Into<String>>(header: impl IntoIterator<Item = S>) -> Self {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row.
    #[must_use]
    pub fn with_row<S: Into<String>>(mut self, cells: impl IntoIterator<Item = Option<S>>) -> Self {
        self.rows
            .push(cells.into_iter().map(|cell| cell.map(Into::into)).collect());
        self
    }

    /// Index of a column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|column| column == name)
    }

    /// Number of data rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no data rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes the table as delimited text.
    #[must_use]
    pub fn to_bytes(&self, options: &DelimitedOptions) -> Vec<u8> {
        let mut out = String::new();
        options.write_record(&mut out, self.header.iter().map(|name| Some(name.as_str())));
        for row in &self.rows {
            options.write_record(&mut out, row.iter().map(Option::as_deref));
        }
        out.into_bytes()
    }
}

#[derive(Default)]
struct FieldState {
    text: String,
    quoted: bool,
    closed: bool,
}

/// Parses delimited text produced by [`serialize`] or by the remote service.
///
/// A leading byte-order mark is skipped and both LF and CRLF terminators
/// are accepted. Empty input yields an empty table.
pub fn parse(bytes: &[u8], options: &DelimitedOptions) -> Result<Table, DelimitedError> {
    let text = std::str::from_utf8(bytes).map_err(|e| DelimitedError {
        line: 1,
        message: format!("payload is not UTF-8: {e}"),
    })?;
    let text = text.strip_prefix(BOM).unwrap_or(text);

    let mut records: Vec<(usize, Vec<Option<String>>)> = Vec::new();
    let mut record: Vec<Option<String>> = Vec::new();
    let mut field = FieldState::default();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;

    let finish_field = |field: FieldState, record: &mut Vec<Option<String>>| {
        if !field.quoted && field.text == options.null_token {
            record.push(None);
        } else {
            record.push(Some(field.text));
        }
    };

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == QUOTE {
                if chars.peek() == Some(&QUOTE) {
                    chars.next();
                    field.text.push(QUOTE);
                } else {
                    in_quotes = false;
                    field.closed = true;
                }
            } else {
                if c == '\n' {
                    line += 1;
                }
                field.text.push(c);
            }
            continue;
        }

        if c == options.delimiter {
            finish_field(std::mem::take(&mut field), &mut record);
        } else if c == '\n' || c == '\r' {
            if c == '\r' && chars.peek() == Some(&'\n') {
                chars.next();
            }
            finish_field(std::mem::take(&mut field), &mut record);
            records.push((record_line, std::mem::take(&mut record)));
            line += 1;
            record_line = line;
        } else if field.closed {
            return Err(DelimitedError {
                line,
                message: format!("unexpected character {c:?} after closing quote"),
            });
        } else if c == QUOTE {
            if field.quoted || !field.text.is_empty() {
                return Err(DelimitedError {
                    line,
                    message: "quote inside an unquoted field".to_string(),
                });
            }
            field.quoted = true;
            in_quotes = true;
        } else {
            field.text.push(c);
        }
    }

    if in_quotes {
        return Err(DelimitedError {
            line: record_line,
            message: "unterminated quoted field".to_string(),
        });
    }
    if field.quoted || !field.text.is_empty() || !record.is_empty() {
        finish_field(field, &mut record);
        records.push((record_line, record));
    }

    let mut records = records.into_iter();
    let Some((_, header)) = records.next() else {
        return Ok(Table::default());
    };
    let header: Vec<String> = header.into_iter().map(Option::unwrap_or_default).collect();

    let mut rows = Vec::new();
    for (line, row) in records {
        if row.len() != header.len() {
            return Err(DelimitedError {
                line,
                message: format!("expected {} field(s), found {}", header.len(), row.len()),
            });
        }
        rows.push(row);
    }

    Ok(Table { header, rows })
}

/// Base64-encoded MD5 digest of a payload, as sent in `Content-MD5`.
#[must_use]
pub fn payload_checksum(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    BASE64.encode(hasher.finalize())
}

/// A serialized batch ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// The encoded rows.
    pub bytes: Vec<u8>,
    /// HTTP content type.
    pub content_type: &'static str,
    /// Base64 MD5 of `bytes`.
    pub checksum: String,
    /// Number of data rows.
    pub rows: usize,
}

impl Payload {
    /// Serializes a batch and computes its checksum.
    pub fn encode(
        batch: &Batch,
        format: ContentFormat,
        options: &DelimitedOptions,
    ) -> Result<Self, InputValidationError> {
        let bytes = serialize(batch, format, options)?;
        let checksum = payload_checksum(&bytes);
        Ok(Self {
            bytes,
            content_type: format.mime_type(),
            checksum,
            rows: batch.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldValue, Row};
    use pretty_assertions::assert_eq;

    fn text(bytes: &[u8]) -> &str {
        std::str::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_serialize_header_and_rows() {
        let batch = Batch::new(vec![
            Row::new().with("Id", "5003").with("Status", "Closed"),
            Row::new().with("Id", "5004").with("Status", FieldValue::Null),
        ]);
        let bytes = serialize(&batch, ContentFormat::DelimitedText, &DelimitedOptions::default()).unwrap();
        assert_eq!(text(&bytes), "Id,Status\n5003,Closed\n5004,\n");
    }

    #[test]
    fn test_serialize_quotes_special_characters() {
        let batch = Batch::new(vec![Row::new()
            .with("Id", "1")
            .with("Subject", "Refund, \"urgent\"")
            .with("Body", "line one\nline two")
            .with("Empty", "")]);
        let bytes = serialize(&batch, ContentFormat::DelimitedText, &DelimitedOptions::default()).unwrap();
        assert_eq!(
            text(&bytes),
            "Id,Subject,Body,Empty\n1,\"Refund, \"\"urgent\"\"\",\"line one\nline two\",\"\"\n"
        );
    }

    #[test]
    fn test_serialize_is_deterministic_and_fills_missing_fields() {
        let batch = Batch::new(vec![
            Row::new().with("Id", 1).with("Score", 2.5).with("Active", true),
            Row::new().with("Id", 2),
        ]);
        let options = DelimitedOptions::default().with_line_ending(LineEnding::Crlf);
        let first = serialize(&batch, ContentFormat::DelimitedText, &options).unwrap();
        let second = serialize(&batch, ContentFormat::DelimitedText, &options).unwrap();
        assert_eq!(first, second);
        assert_eq!(text(&first), "Id,Score,Active\r\n1,2.5,true\r\n2,,\r\n");
    }

    #[test]
    fn test_serialize_rejects_unknown_field_and_bad_delimiter() {
        let batch = Batch::new(vec![Row::new().with("Id", 1), Row::new().with("Id", 2).with("X", 3)]);
        assert!(matches!(
            serialize(&batch, ContentFormat::DelimitedText, &DelimitedOptions::default()),
            Err(InputValidationError::UnknownField { row: 1, .. })
        ));

        let batch = Batch::new(vec![Row::new().with("Id", 1)]);
        let options = DelimitedOptions::default().with_delimiter('#');
        assert_eq!(
            serialize(&batch, ContentFormat::DelimitedText, &options),
            Err(InputValidationError::InvalidDelimiter('#'))
        );
    }

    #[test]
    fn test_parse_distinguishes_null_from_empty() {
        let table = parse(b"Id,Name\n1,\n2,\"\"\n", &DelimitedOptions::default()).unwrap();
        assert_eq!(table.header, vec!["Id", "Name"]);
        assert_eq!(table.rows[0], vec![Some("1".to_string()), None]);
        assert_eq!(table.rows[1], vec![Some("2".to_string()), Some(String::new())]);
    }

    #[test]
    fn test_parse_quoted_fields_and_crlf() {
        let input = "\u{feff}\"sf__Id\",\"sf__Error\"\r\n\"5003\",\"FIELD, \"\"bad\"\"\nvalue\"\r\n";
        let table = parse(input.as_bytes(), &DelimitedOptions::default()).unwrap();
        assert_eq!(table.header, vec!["sf__Id", "sf__Error"]);
        assert_eq!(
            table.rows,
            vec![vec![
                Some("5003".to_string()),
                Some("FIELD, \"bad\"\nvalue".to_string())
            ]]
        );
    }

    #[test]
    fn test_parse_header_only_and_empty() {
        let table = parse(b"sf__Id,sf__Error\n", &DelimitedOptions::default()).unwrap();
        assert_eq!(table.header.len(), 2);
        assert!(table.is_empty());
        assert_eq!(parse(b"", &DelimitedOptions::default()).unwrap(), Table::default());
    }

    #[test]
    fn test_parse_errors() {
        let options = DelimitedOptions::default();
        let err = parse(b"a,b\n1,2,3\n", &options).unwrap_err();
        assert_eq!(err.line, 2);

        let err = parse(b"a,b\n\"1,2\n", &options).unwrap_err();
        assert_eq!(err.message, "unterminated quoted field");

        assert!(parse(b"a,b\n\"1\"x,2\n", &options).is_err());
    }

    #[test]
    fn test_table_round_trip_with_custom_options() {
        let options = DelimitedOptions::default()
            .with_delimiter('|')
            .with_null_token("NULL");
        let table = Table::new(["Id", "Note"])
            .with_row([Some("1"), None])
            .with_row([Some("2"), Some("NULL")])
            .with_row([Some("3"), Some("a|b")]);
        let bytes = table.to_bytes(&options);
        assert_eq!(text(&bytes), "Id|Note\n1|NULL\n2|\"NULL\"\n3|\"a|b\"\n");
        assert_eq!(parse(&bytes, &options).unwrap(), table);
    }

    #[test]
    fn test_payload_checksum() {
        assert_eq!(payload_checksum(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
        let batch = Batch::new(vec![Row::new().with("Id", "A1")]);
        let payload =
            Payload::encode(&batch, ContentFormat::DelimitedText, &DelimitedOptions::default()).unwrap();
        assert_eq!(payload.rows, 1);
        assert_eq!(payload.checksum, payload_checksum(b"Id\nA1\n"));
        assert_eq!(payload.content_type, "text/csv; charset=utf-8");
    }

    #[test]
    fn test_wire_names() {
        let options = DelimitedOptions::default();
        assert_eq!(options.wire_delimiter_name(), Some("COMMA"));
        assert_eq!(options.line_ending.wire_name(), "LF");
        assert_eq!(
            DelimitedOptions::default().with_delimiter('\t').wire_delimiter_name(),
            Some("TAB")
        );
    }
}
