use std::fmt;

use sqlx::{PgConnection, PgPool};

use crate::repositories::sequences;

/// Counter row that backs automatically assigned certificate numbers.
pub(crate) const STUDENT_SEQUENCE: &str = "students";

const MAX_NUMBER_LEN: usize = 64;

/// A certificate number, either drawn from the counter or supplied by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CertificateNumber {
    value: String,
    allocated: Option<i64>,
}

impl CertificateNumber {
    pub(crate) fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for CertificateNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Letters, digits, `.`, `_` and `-`, starting with a letter or digit.
pub(crate) fn is_valid_explicit(raw: &str) -> bool {
    let mut chars = raw.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    raw.len() <= MAX_NUMBER_LEN
        && first.is_ascii_alphanumeric()
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}

/// All digits with a leading `0`, such as "0042". Such a number would sit
/// next to the counter's "42" as a different string, so it is refused.
pub(crate) fn is_zero_padded(raw: &str) -> bool {
    raw.starts_with('0') && raw.bytes().all(|b| b.is_ascii_digit())
}

/// Numeric value of a canonical decimal certificate number.
pub(crate) fn numeric_value(raw: &str) -> Option<i64> {
    if raw.is_empty()
        || raw.len() > 18
        || is_zero_padded(raw)
        || !raw.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    raw.parse().ok()
}

/// Draws the next number. Must run inside the transaction that inserts the
/// student, so the counter lock is held until the row is committed.
pub(crate) async fn allocate(conn: &mut PgConnection) -> Result<CertificateNumber, sqlx::Error> {
    let value = sequences::next_value(conn, STUDENT_SEQUENCE).await?;
    Ok(CertificateNumber { value: value.to_string(), allocated: Some(value) })
}

/// Accepts an operator supplied number and keeps the counter ahead of it.
pub(crate) async fn accept_explicit(
    conn: &mut PgConnection,
    raw: &str,
) -> Result<CertificateNumber, sqlx::Error> {
    if let Some(value) = numeric_value(raw) {
        sequences::advance_to(conn, STUDENT_SEQUENCE, value).await?;
    }
    Ok(CertificateNumber { value: raw.to_string(), allocated: None })
}

/// Pushes the counter past numbers that were written without going through it.
pub(crate) async fn resync(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let value = sequences::resync_with_students(pool, STUDENT_SEQUENCE).await?;
    tracing::info!(last_value = value, "Resynchronised certificate number counter");
    Ok(value)
}

/// Gives a counter-drawn number back after its student was rolled back.
/// Only the most recent allocation can be returned.
pub(crate) async fn release(
    pool: &PgPool,
    number: &CertificateNumber,
) -> Result<bool, sqlx::Error> {
    match number.allocated {
        Some(value) => sequences::release(pool, STUDENT_SEQUENCE, value).await,
        None => Ok(false),
    }
}
