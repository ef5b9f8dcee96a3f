//! Header-based CSV reader for the FIRMS country feed.
//!
//! Quoted fields may contain commas, newlines and doubled quotes (`""`). Blank lines
//! are skipped; a data line shorter than the header leaves the missing columns absent,
//! and extra trailing fields are ignored.

use serde_json::Value;

use crate::RawRow;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CsvError {
    #[error("csv input has no header line")]
    Empty,
    #[error("unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },
    #[error("csv header is missing required column `{0}`")]
    MissingColumn(String),
}

/// Split CSV text into records of raw fields.
///
/// # Errors
/// Returns `CsvError::UnterminatedQuote` when a quoted field never closes.
pub fn parse_records(text: &str) -> Result<Vec<Vec<String>>, CsvError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1_usize;
    let mut quote_line = 1_usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                line += 1;
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(CsvError::UnterminatedQuote { line: quote_line });
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }
    Ok(records)
}

/// Parse CSV text into rows keyed by the header line.
///
/// # Errors
/// Returns `CsvError::Empty` without a header, `CsvError::MissingColumn` when any of
/// `required` is absent from the header, or a quoting error from [`parse_records`].
pub fn parse_rows(text: &str, required: &[&str]) -> Result<Vec<RawRow>, CsvError> {
    let mut records = parse_records(text)?.into_iter();
    let header: Vec<String> = records
        .next()
        .ok_or(CsvError::Empty)?
        .into_iter()
        .map(|name| name.trim().to_string())
        .collect();

    for column in required {
        if !header.iter().any(|name| name == column) {
            return Err(CsvError::MissingColumn((*column).to_string()));
        }
    }

    Ok(records
        .map(|fields| {
            header
                .iter()
                .zip(fields)
                .filter(|(name, _)| !name.is_empty())
                .map(|(name, value)| (name.clone(), Value::String(value)))
                .collect()
        })
        .collect())
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    let blank = record.len() == 1 && record.first().is_some_and(|field| field.trim().is_empty());
    if !blank {
        records.push(record);
    }
}
