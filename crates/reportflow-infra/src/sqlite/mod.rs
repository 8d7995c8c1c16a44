//! SQLite storage layer.
//!
//! Adapters backed by SQLite with WAL mode and split read/write connection
//! pools. Every state transition that must be atomic across processes is a
//! single conditional statement on the writer connection.

pub mod breaker;
pub mod pool;
pub mod queue;
pub mod schedule;
pub mod workflow;

use chrono::{DateTime, SecondsFormat, Utc};
use reportflow_types::error::RepositoryError;
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn parse_optional_datetime(
    s: Option<&str>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

/// Fixed-width UTC so that SQL string comparison orders by time.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::pool::DatabasePool;

    pub async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn formatted_datetimes_sort_chronologically() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 59, 59).unwrap();
        let later = base + Duration::milliseconds(1);
        let much_later = base + Duration::hours(2);
        assert!(format_datetime(&base) < format_datetime(&later));
        assert!(format_datetime(&later) < format_datetime(&much_later));
        assert_eq!(format_datetime(&base), "2026-03-01T09:59:59.000000Z");
    }

    #[test]
    fn datetime_round_trips_at_microsecond_precision() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::microseconds(123_456);
        assert_eq!(parse_datetime(&format_datetime(&at)).unwrap(), at);
    }

    #[test]
    fn bad_values_are_query_errors() {
        assert!(matches!(parse_uuid("nope"), Err(RepositoryError::Query(_))));
        assert!(matches!(parse_datetime("yesterday"), Err(RepositoryError::Query(_))));
        assert_eq!(parse_optional_datetime(None).unwrap(), None);
    }
}
