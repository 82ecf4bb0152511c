use pricewise_core::chrono::{DateTime, SecondsFormat, Utc};
use pricewise_core::StoreError;
use rust_decimal::Decimal;
use thiserror::Error;

pub mod assignment;
pub mod event;
pub mod experiment;
pub mod memory;

pub use assignment::SqlAssignmentRepository;
pub use event::SqlEventRepository;
pub use experiment::SqlExperimentRepository;
pub use memory::{InMemoryAssignmentStore, InMemoryEventLog, InMemoryExperimentCatalog};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => StoreError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Corrupt(message),
            RepositoryError::Encode(message) => StoreError::Corrupt(message),
        }
    }
}

/// Fixed-width UTC text so stored timestamps order lexicographically.
pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_decimal(column: &str, value: &str) -> Result<Decimal, RepositoryError> {
    value.parse::<Decimal>().map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("value in `{column}` is out of range for u32: {value}"))
    })
}

#[cfg(test)]
mod tests {
    use pricewise_core::StoreError;

    use super::{format_timestamp, parse_decimal, parse_timestamp, RepositoryError};

    #[test]
    fn decode_failures_surface_as_corrupt_store_data() {
        let error = parse_decimal("price", "twelve").expect_err("invalid decimal");
        assert!(matches!(
            StoreError::from(error),
            StoreError::Corrupt(ref m) if m.contains("price")
        ));

        let database = RepositoryError::Database(sqlx::Error::PoolTimedOut);
        assert!(matches!(StoreError::from(database), StoreError::Unavailable(_)));
    }

    #[test]
    fn timestamps_are_stored_with_fixed_precision() {
        let parsed = parse_timestamp("at", "2026-03-01T10:00:00Z".to_string()).expect("parse");
        assert_eq!(format_timestamp(&parsed), "2026-03-01T10:00:00.000000Z");
    }
}
