//! Annotated-CSV decoding for Flux query results.
//!
//! The query API answers in InfluxDB annotated CSV. The engine only ever
//! extracts single scalars (`_value`) or timestamps (`_time`) from result
//! rows, so this decoder maps header columns to row fields and nothing more.
//! Annotation lines (`#datatype`, `#group`, `#default`) are skipped; each
//! blank-line-separated table carries its own header.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while decoding a query response.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("row has {got} fields, header has {want}")]
    RaggedRow { got: usize, want: usize },

    #[error("column {name:?} holds {value:?}: not a float")]
    NotAFloat { name: String, value: String },

    #[error("column {name:?} holds {value:?}: not an integer")]
    NotAnInteger { name: String, value: String },

    #[error("column {name:?} holds {value:?}: not an RFC 3339 timestamp")]
    NotATimestamp { name: String, value: String },
}

/// One data row, paired with the header of its table.
#[derive(Debug, Clone)]
pub struct Record {
    columns: Vec<String>,
    values: Vec<String>,
}

impl Record {
    /// Raw field value by column name.
    pub fn get(&self, name: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx).map(String::as_str)
    }

    /// Field value decoded as f64.
    pub fn f64(&self, name: &str) -> Result<f64, DecodeError> {
        let raw = self.get(name).unwrap_or("");
        raw.parse().map_err(|_| DecodeError::NotAFloat {
            name: name.to_string(),
            value: raw.to_string(),
        })
    }

    /// Field value decoded as i64.
    pub fn i64(&self, name: &str) -> Result<i64, DecodeError> {
        let raw = self.get(name).unwrap_or("");
        raw.parse().map_err(|_| DecodeError::NotAnInteger {
            name: name.to_string(),
            value: raw.to_string(),
        })
    }

    /// Field value decoded as an RFC 3339 timestamp.
    pub fn time(&self, name: &str) -> Result<DateTime<Utc>, DecodeError> {
        let raw = self.get(name).unwrap_or("");
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| DecodeError::NotATimestamp {
                name: name.to_string(),
                value: raw.to_string(),
            })
    }
}

/// Decode a response body into data records across all result tables.
pub fn decode(body: &str) -> Result<Vec<Record>, DecodeError> {
    let mut records = Vec::new();
    let mut header: Option<Vec<String>> = None;

    for line in body.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            // Table boundary; the next non-annotation line is a new header.
            header = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let fields = split_line(line);
        match &header {
            None => header = Some(fields),
            Some(cols) => {
                if fields.len() != cols.len() {
                    return Err(DecodeError::RaggedRow {
                        got: fields.len(),
                        want: cols.len(),
                    });
                }
                records.push(Record {
                    columns: cols.clone(),
                    values: fields,
                });
            }
        }
    }

    Ok(records)
}

/// Last `_value` across all rows, decoded as f64. `None` when the result is
/// empty (a query that matched no points).
pub fn last_value_f64(body: &str) -> Result<Option<f64>, DecodeError> {
    let records = decode(body)?;
    match records.last() {
        Some(r) if !r.get("_value").unwrap_or("").is_empty() => r.f64("_value").map(Some),
        _ => Ok(None),
    }
}

/// Last `_value` across all rows, decoded as i64.
pub fn last_value_i64(body: &str) -> Result<Option<i64>, DecodeError> {
    let records = decode(body)?;
    match records.last() {
        Some(r) if !r.get("_value").unwrap_or("").is_empty() => r.i64("_value").map(Some),
        _ => Ok(None),
    }
}

/// All `_value` strings across all rows, in row order.
pub fn values_string(body: &str) -> Result<Vec<String>, DecodeError> {
    let records = decode(body)?;
    Ok(records
        .iter()
        .filter_map(|r| r.get("_value"))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect())
}

/// Last `_time` across all rows. `None` when the result is empty.
pub fn last_time(body: &str) -> Result<Option<DateTime<Utc>>, DecodeError> {
    let records = decode(body)?;
    match records.last() {
        Some(r) if !r.get("_time").unwrap_or("").is_empty() => r.time("_time").map(Some),
        _ => Ok(None),
    }
}

/// Split one CSV line into fields, honoring double-quoted fields with `""`
/// escapes. Tag values with commas are rare but legal.
fn split_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if field.is_empty() => quoted = true,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);

    fields
}
