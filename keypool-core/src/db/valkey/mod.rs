mod buckets;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

pub use buckets::{BucketKeyspace, ValkeyBucketStore};

use crate::db::{HealthCheckable, bounded_health_check};
use crate::error::{Error, ErrorDetails};

/// Connection info for the Valkey (Redis-compatible) bucket store.
///
/// `ConnectionManager` reconnects on its own and multiplexes commands over one
/// connection, so it is cloned per call instead of pooled.
#[derive(Clone)]
pub enum ValkeyConnectionInfo {
    Enabled { connection: Box<ConnectionManager> },
    Disabled,
}

impl std::fmt::Debug for ValkeyConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enabled { .. } => f.write_str("ValkeyConnectionInfo::Enabled"),
            Self::Disabled => f.write_str("ValkeyConnectionInfo::Disabled"),
        }
    }
}

impl ValkeyConnectionInfo {
    pub async fn new(valkey_url: &str) -> Result<Self, Error> {
        let client = Client::open(valkey_url).map_err(|e| {
            Error::new(ErrorDetails::ValkeyConnection {
                message: format!("Failed to create Valkey client: {e}"),
            })
        })?;

        let mut connection = ConnectionManager::new(client).await.map_err(|e| {
            Error::new(ErrorDetails::ValkeyConnection {
                message: format!("Failed to connect to Valkey: {e}"),
            })
        })?;

        Self::load_function_library(&mut connection).await?;

        Ok(Self::Enabled {
            connection: Box::new(connection),
        })
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    pub fn get_connection(&self) -> Option<&ConnectionManager> {
        match self {
            Self::Enabled { connection } => Some(connection),
            Self::Disabled => None,
        }
    }

    /// Loads the bucket function library. Called once per connection at startup;
    /// `REPLACE` lets a newer gateway overwrite the library left by an older one.
    async fn load_function_library(connection: &mut ConnectionManager) -> Result<(), Error> {
        let loaded: String = redis::cmd("FUNCTION")
            .arg("LOAD")
            .arg("REPLACE")
            .arg(BUCKET_LIBRARY)
            .query_async(connection)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::ValkeyQuery {
                    message: format!("Failed to load function library: {e}"),
                })
            })?;
        check_loaded_library(&loaded)?;
        tracing::debug!(library = %loaded, "Loaded bucket function library");
        Ok(())
    }
}

const BUCKET_LIBRARY: &str = include_str!("lua/keypool_buckets.lua");
const BUCKET_LIBRARY_NAME: &str = "keypool";

/// `FUNCTION LOAD` answers with the library name from the `#!lua name=` header.
/// A different name means the functions we `FCALL` were registered elsewhere.
fn check_loaded_library(loaded: &str) -> Result<(), Error> {
    if loaded == BUCKET_LIBRARY_NAME {
        Ok(())
    } else {
        Err(Error::new(ErrorDetails::ValkeyQuery {
            message: format!(
                "Function library loaded as `{loaded}`, expected `{BUCKET_LIBRARY_NAME}`"
            ),
        }))
    }
}

#[async_trait]
impl HealthCheckable for ValkeyConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        let Some(connection) = self.get_connection() else {
            return Ok(());
        };
        let mut conn = connection.clone();
        let ping = async move {
            let _: String = conn.ping().await.map_err(|e| {
                Error::new(ErrorDetails::ValkeyConnection {
                    message: format!("Valkey health check failed: {e}"),
                })
            })?;
            Ok(())
        };
        bounded_health_check(ping, || {
            Error::new(ErrorDetails::ValkeyConnection {
                message: "Valkey health check timed out".to_string(),
            })
        })
        .await
    }
}
