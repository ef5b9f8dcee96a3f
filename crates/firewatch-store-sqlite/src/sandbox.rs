//! Allow-list validation for scalar queries written by an untrusted caller.
//!
//! The text check runs before the engine sees the query; the store then verifies the
//! compiled statement is read-only and yields a single numeric cell.
//!
//! Denied keywords are matched on the whole text, string literals included, so
//! `WHERE version = 'update'` is rejected too. Callers needing such a literal are
//! refused rather than parsed.

use rusqlite::Connection;

pub const MAX_SCALAR_QUERY_BYTES: usize = 4096;

const DENIED_KEYWORDS: &[&str] = &[
    "insert",
    "update",
    "delete",
    "drop",
    "alter",
    "create",
    "replace",
    "attach",
    "detach",
    "pragma",
    "vacuum",
    "reindex",
    "analyze",
    "begin",
    "commit",
    "rollback",
    "savepoint",
    "release",
    "load_extension",
];

const COMMENT_MARKERS: &[&str] = &["--", "/*", "*/"];

#[derive(Debug, thiserror::Error)]
pub enum ScalarQueryError {
    #[error("scalar query rejected: {0}")]
    Rejected(String),
    #[error("scalar query failed in the engine: {0}")]
    Engine(#[from] rusqlite::Error),
    /// `PRAGMA query_only` could not be switched; the store itself is at fault.
    #[error("failed to toggle query_only mode: {0}")]
    Guard(#[source] rusqlite::Error),
}

/// Validate query text and return the statement to compile, without any trailing `;`.
///
/// # Errors
/// Returns `ScalarQueryError::Rejected` naming the first rule the text breaks.
pub fn validate_scalar_query(sql: &str) -> Result<&str, ScalarQueryError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(reject("query is empty"));
    }
    if trimmed.len() > MAX_SCALAR_QUERY_BYTES {
        return Err(reject(format!("query exceeds {MAX_SCALAR_QUERY_BYTES} bytes")));
    }
    if trimmed.chars().any(is_unicode_confusable) {
        return Err(reject("query contains look-alike punctuation"));
    }

    let body = trimmed.strip_suffix(';').map_or(trimmed, str::trim_end);
    if body.contains(';') {
        return Err(reject("multiple statements are not allowed"));
    }
    if COMMENT_MARKERS.iter().any(|marker| body.contains(marker)) {
        return Err(reject("comments are not allowed"));
    }

    let lower = body.to_ascii_lowercase();
    let mut words = lower.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'));
    if !lower.starts_with("select") || words.next() != Some("select") {
        return Err(reject("only a single SELECT statement is allowed"));
    }
    if let Some(keyword) = words.find(|word| DENIED_KEYWORDS.contains(word)) {
        return Err(reject(format!("keyword `{keyword}` is not allowed")));
    }

    Ok(body)
}

/// Holds `PRAGMA query_only = ON` until [`QueryOnlyGuard::release`] or drop.
pub(crate) struct QueryOnlyGuard<'conn> {
    conn: &'conn Connection,
    released: bool,
}

impl<'conn> QueryOnlyGuard<'conn> {
    pub(crate) fn enable(conn: &'conn Connection) -> Result<Self, ScalarQueryError> {
        conn.pragma_update(None, "query_only", true).map_err(ScalarQueryError::Guard)?;
        Ok(Self { conn, released: false })
    }

    /// Leave query_only mode, reporting a failure instead of only logging it.
    pub(crate) fn release(mut self) -> Result<(), ScalarQueryError> {
        self.released = true;
        self.conn.pragma_update(None, "query_only", false).map_err(ScalarQueryError::Guard)
    }
}

impl Drop for QueryOnlyGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.conn.pragma_update(None, "query_only", false) {
            tracing::error!(error = %err, "failed to leave query_only mode");
        }
    }
}

fn reject(message: impl Into<String>) -> ScalarQueryError {
    ScalarQueryError::Rejected(message.into())
}

/// Characters that look like quotes, operators, dashes or semicolons.
fn is_unicode_confusable(c: char) -> bool {
    matches!(
        c,
        '\u{02BC}'
            | '\u{02B9}'
            | '\u{2018}'
            | '\u{2019}'
            | '\u{201B}'
            | '\u{FF07}'
            | '\u{02BA}'
            | '\u{201C}'
            | '\u{201D}'
            | '\u{201F}'
            | '\u{FF02}'
            | '\u{FF1D}'
            | '\u{2260}'
            | '\u{FF1C}'
            | '\u{FF1E}'
            | '\u{2010}'
            | '\u{2011}'
            | '\u{2012}'
            | '\u{2013}'
            | '\u{2014}'
            | '\u{2015}'
            | '\u{FE58}'
            | '\u{FF0D}'
            | '\u{037E}'
            | '\u{FF1B}'
    )
}
