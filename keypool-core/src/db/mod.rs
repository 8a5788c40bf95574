use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::Error;

pub mod buckets;
pub mod key_records;
pub mod memory;
pub mod postgres;
pub mod valkey;

pub use buckets::*;
pub use key_records::*;

#[async_trait]
pub trait HealthCheckable {
    async fn health(&self) -> Result<(), Error>;
}

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs one store health check, reporting `on_timeout()` if it does not answer within a second.
async fn bounded_health_check(
    check: impl Future<Output = Result<(), Error>>,
    on_timeout: impl FnOnce() -> Error,
) -> Result<(), Error> {
    timeout(HEALTH_CHECK_TIMEOUT, check)
        .await
        .unwrap_or_else(|_| Err(on_timeout()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetails;

    fn timed_out() -> Error {
        Error::new(ErrorDetails::PostgresQuery {
            message: "health check timed out".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_health_check_reports_timeout_error() {
        let started = tokio::time::Instant::now();
        let err = bounded_health_check(std::future::pending(), timed_out)
            .await
            .unwrap_err();
        assert!(
            matches!(err.get_details(), ErrorDetails::PostgresQuery { message } if message == "health check timed out"),
            "unexpected error: {err}"
        );
        assert_eq!(started.elapsed(), HEALTH_CHECK_TIMEOUT);
    }

    #[tokio::test]
    async fn test_health_check_failure_passes_through() {
        bounded_health_check(async { Ok(()) }, timed_out)
            .await
            .unwrap();
        let err = bounded_health_check(
            async {
                Err(Error::new(ErrorDetails::ValkeyConnection {
                    message: "refused".to_string(),
                }))
            },
            timed_out,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::ValkeyConnection { .. }
        ));
    }
}
