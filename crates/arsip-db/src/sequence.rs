//! Per-scope sequence counters and document numbers.
//!
//! Each scope key (for mail numbers, the calendar year) owns one row in
//! `sequence_counters`. Allocation reads the row, creates it at zero if it is
//! missing, and increments it, all inside one transaction. Values are never
//! reused: a number whose transaction rolls back leaves a gap, but no two
//! callers ever receive the same value for a scope.
//!
//! ```rust,ignore
//! let number = db.next_sequence("2025", "SK", 3, 2025).await?;
//! assert_eq!(number, "0001/SK/III/2025");
//! ```

use std::fmt;
use std::str::FromStr;

use rusqlite::types::Value;

use crate::connection::Database;
use crate::error::DbError;
use crate::transaction::Transaction;

const ROMAN_MONTHS: [&str; 12] = [
    "I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X", "XI", "XII",
];

/// Roman numeral for a month number, `None` outside `1..=12`.
pub fn roman_month(month: u8) -> Option<&'static str> {
    month
        .checked_sub(1)
        .and_then(|idx| ROMAN_MONTHS.get(usize::from(idx)))
        .copied()
}

fn month_from_roman(numeral: &str) -> Option<u8> {
    ROMAN_MONTHS
        .iter()
        .position(|m| *m == numeral)
        .and_then(|idx| u8::try_from(idx + 1).ok())
}

/// A formatted document number such as `0090/SK/III/2025`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentNumber {
    /// Allocated counter value, zero-padded to four digits when formatted.
    pub counter: i64,
    /// Category code, e.g. `SK`.
    pub category_code: String,
    /// Month number, `1..=12`, formatted as a Roman numeral.
    pub month: u8,
    /// Four-digit year.
    pub year: i32,
}

impl DocumentNumber {
    /// Builds a document number after validating every component.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidDocumentNumber` if the counter is not
    /// positive, the month is outside `1..=12`, the year is not positive, or
    /// the category code is empty or contains `/` or whitespace.
    pub fn new(
        counter: i64,
        category_code: impl Into<String>,
        month: u8,
        year: i32,
    ) -> Result<Self, DbError> {
        let category_code = category_code.into();
        validate_parts(&category_code, month, year)?;
        if counter < 1 {
            return Err(DbError::InvalidDocumentNumber(format!(
                "counter must be positive, got {counter}"
            )));
        }
        Ok(Self {
            counter,
            category_code,
            month,
            year,
        })
    }
}

/// Checks that `code` can appear as the category segment of a document
/// number: non-empty, without `/` or whitespace.
///
/// # Errors
///
/// Returns `DbError::InvalidDocumentNumber` naming the rejected code.
pub fn validate_category_code(code: &str) -> Result<(), DbError> {
    if code.is_empty() || code.chars().any(|c| c == '/' || c.is_whitespace()) {
        return Err(DbError::InvalidDocumentNumber(format!(
            "invalid category code '{code}'"
        )));
    }
    Ok(())
}

fn validate_parts(category_code: &str, month: u8, year: i32) -> Result<(), DbError> {
    validate_category_code(category_code)?;
    if roman_month(month).is_none() {
        return Err(DbError::InvalidDocumentNumber(format!(
            "month must be 1..=12, got {month}"
        )));
    }
    if year < 1 {
        return Err(DbError::InvalidDocumentNumber(format!(
            "year must be positive, got {year}"
        )));
    }
    Ok(())
}

impl fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}/{}/{}/{}",
            self.counter,
            self.category_code,
            roman_month(self.month).unwrap_or("?"),
            self.year
        )
    }
}

impl FromStr for DocumentNumber {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DbError::InvalidDocumentNumber(format!("cannot parse '{s}'"));

        let mut parts = s.split('/');
        let (Some(counter), Some(code), Some(month), Some(year), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid());
        };

        if counter.len() < 4 || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let counter = counter.parse().map_err(|_| invalid())?;
        let month = month_from_roman(month).ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;

        Self::new(counter, code, month, year)
    }
}

/// Advances the counter for `scope_key` inside the caller's transaction and
/// returns the new value.
///
/// Use this when the number must be allocated atomically with other writes
/// (for example inserting the document that carries it). The value is only
/// final once the surrounding transaction commits.
///
/// # Errors
///
/// Returns `DbError::SequenceAllocation` wrapping the statement failure or an
/// inconsistent read.
pub fn allocate(tx: &Transaction<'_>, scope_key: &str) -> Result<i64, DbError> {
    advance(tx, scope_key).map_err(|e| allocation_error(scope_key, e))
}

fn advance(tx: &Transaction<'_>, scope_key: &str) -> Result<i64, DbError> {
    let key = [Value::Text(scope_key.to_string())];

    let previous = match tx.fetch_one(
        "SELECT value FROM sequence_counters WHERE scope_key = ?1",
        &key,
    )? {
        Some(row) => row.get::<i64>("value")?,
        None => {
            tx.execute(
                "INSERT INTO sequence_counters (scope_key, value) VALUES (?1, 0)",
                &key,
            )?;
            tracing::debug!(scope_key, "created sequence counter");
            0
        }
    };

    let found = tx
        .fetch_one(
            "UPDATE sequence_counters
             SET value = value + 1, updated_at = datetime('now')
             WHERE scope_key = ?1
             RETURNING value",
            &key,
        )?
        .map(|row| row.get::<i64>("value"))
        .transpose()?;

    match found {
        Some(next) if next == previous + 1 => Ok(next),
        found => Err(DbError::InconsistentCounter { previous, found }),
    }
}

fn allocation_error(scope_key: &str, e: DbError) -> DbError {
    match e {
        e @ DbError::SequenceAllocation { .. } => e,
        other => DbError::SequenceAllocation {
            scope_key: scope_key.to_string(),
            source: Box::new(other),
        },
    }
}

impl Database {
    /// Allocates the next value for `scope_key` in its own transaction.
    ///
    /// The first allocation for a new scope key returns 1.
    ///
    /// # Errors
    ///
    /// Every failure, including acquire and commit failures, is returned as
    /// `DbError::SequenceAllocation`. Nothing is allocated in that case.
    pub async fn next_sequence_value(&self, scope_key: &str) -> Result<i64, DbError> {
        let key = scope_key.to_string();
        let value = self
            .run_in_transaction(move |tx| allocate(tx, &key))
            .await
            .map_err(|e| allocation_error(scope_key, e))?;

        tracing::debug!(scope_key, value, "allocated sequence value");
        Ok(value)
    }

    /// Allocates the next value for `scope_key` and formats it as
    /// `{value:04}/{category_code}/{roman month}/{year}`.
    ///
    /// Inputs are validated before anything is allocated, and the number is
    /// formatted only after the allocation has committed.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidDocumentNumber` for bad inputs and
    /// `DbError::SequenceAllocation` if the counter cannot be advanced.
    pub async fn next_sequence(
        &self,
        scope_key: &str,
        category_code: &str,
        month: u8,
        year: i32,
    ) -> Result<String, DbError> {
        validate_parts(category_code, month, year)?;
        let counter = self.next_sequence_value(scope_key).await?;
        Ok(DocumentNumber::new(counter, category_code, month, year)?.to_string())
    }

    /// Current value of the counter for `scope_key`, `None` if nothing has
    /// been allocated in that scope yet.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Statement` if the lookup fails.
    pub async fn current_sequence_value(&self, scope_key: &str) -> Result<Option<i64>, DbError> {
        self.fetch_one(
            "SELECT value FROM sequence_counters WHERE scope_key = ?1",
            &[Value::Text(scope_key.to_string())],
        )
        .await?
        .map(|row| row.get("value"))
        .transpose()
    }
}
