use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::db::{HealthCheckable, bounded_health_check};
use crate::error::{Error, ErrorDetails};

mod key_records;

/// Connection to the relational store that owns the `api_keys` table.
#[derive(Debug, Clone)]
pub enum PostgresConnectionInfo {
    Enabled { pool: PgPool },
    Disabled,
}

impl PostgresConnectionInfo {
    pub async fn new(postgres_url: &SecretString) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(postgres_url.expose_secret())
            .await
            .map_err(|err| {
                Error::new(ErrorDetails::PostgresConnectionInitialization {
                    message: err.to_string(),
                })
            })?;
        Ok(Self::Enabled { pool })
    }

    pub fn new_with_pool(pool: PgPool) -> Self {
        Self::Enabled { pool }
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    pub fn get_pool(&self) -> Option<&PgPool> {
        match self {
            Self::Enabled { pool } => Some(pool),
            Self::Disabled => None,
        }
    }

    pub fn get_pool_result(&self) -> Result<&PgPool, Error> {
        self.get_pool().ok_or_else(|| {
            Error::new(ErrorDetails::KeyRecordStoreUnavailable {
                message: "Postgres connection is disabled. Set `KEYPOOL_POSTGRES_URL`.".to_string(),
            })
        })
    }
}

#[async_trait]
impl HealthCheckable for PostgresConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        let Some(pool) = self.get_pool() else {
            return Ok(());
        };
        let check = async {
            sqlx::query("SELECT 1").execute(pool).await.map_err(|e| {
                Error::new(ErrorDetails::PostgresQuery {
                    message: format!("Postgres health check failed: {e}"),
                })
            })?;
            Ok(())
        };
        bounded_health_check(check, || {
            Error::new(ErrorDetails::PostgresQuery {
                message: "Postgres health check timed out".to_string(),
            })
        })
        .await
    }
}
