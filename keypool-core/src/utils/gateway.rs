use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, Json, Request};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::config::{BucketStoreBackend, Config};
use crate::db::memory::MemoryBucketStore;
use crate::db::postgres::PostgresConnectionInfo;
use crate::db::valkey::{ValkeyBucketStore, ValkeyConnectionInfo};
use crate::db::{BucketQueries, DisabledBucketQueries, KeyRecordQueries};
use crate::error::{Error, ErrorDetails};
use crate::pool::KeyPool;
use crate::tasks::spawn_background_tasks;

pub const VALKEY_URL_ENV_VAR: &str = "KEYPOOL_VALKEY_URL";
pub const POSTGRES_URL_ENV_VAR: &str = "KEYPOOL_POSTGRES_URL";

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub pool: KeyPool,
    pub valkey_connection_info: ValkeyConnectionInfo,
    pub postgres_connection_info: PostgresConnectionInfo,
    /// Background maintenance tasks, awaited on shutdown
    pub deferred_tasks: TaskTracker,
}
pub type AppState = axum::extract::State<AppStateData>;

/// Owns the app state and stops the background tasks when dropped.
pub struct GatewayHandle {
    pub app_state: AppStateData,
    pub cancel_token: CancellationToken,
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl GatewayHandle {
    /// Connects to the configured stores and starts the background tasks.
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let valkey_url = std::env::var(VALKEY_URL_ENV_VAR).ok();
        let postgres_url = std::env::var(POSTGRES_URL_ENV_VAR)
            .ok()
            .map(SecretString::from);

        let valkey_connection_info = match (config.bucket_store.backend, valkey_url) {
            _ if !config.token_bucket.enabled => {
                tracing::info!("Token buckets are disabled, so keys are selected uniformly at random");
                ValkeyConnectionInfo::new_disabled()
            }
            (BucketStoreBackend::Memory, _) => ValkeyConnectionInfo::new_disabled(),
            (BucketStoreBackend::Valkey | BucketStoreBackend::Auto, Some(url)) => {
                ValkeyConnectionInfo::new(&url).await?
            }
            (BucketStoreBackend::Valkey, None) => {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "`bucket_store.backend` is `valkey`, but `{VALKEY_URL_ENV_VAR}` is not set"
                    ),
                }));
            }
            (BucketStoreBackend::Auto, None) => {
                tracing::warn!(
                    "`{VALKEY_URL_ENV_VAR}` is not set, so token buckets are kept in process memory. Replicas will not share rate limits."
                );
                ValkeyConnectionInfo::new_disabled()
            }
        };

        let postgres_connection_info = match postgres_url {
            Some(url) => PostgresConnectionInfo::new(&url).await?,
            None => {
                tracing::warn!(
                    "`{POSTGRES_URL_ENV_VAR}` is not set, so no key records can be read and every selection will fail."
                );
                PostgresConnectionInfo::new_disabled()
            }
        };

        let store: Arc<dyn BucketQueries> = match valkey_connection_info {
            _ if !config.token_bucket.enabled => Arc::new(DisabledBucketQueries),
            ValkeyConnectionInfo::Enabled { .. } => Arc::new(ValkeyBucketStore::new(
                valkey_connection_info.clone(),
                &config.bucket_store,
            )),
            ValkeyConnectionInfo::Disabled => {
                Arc::new(MemoryBucketStore::new(config.bucket_store.bucket_ttl()))
            }
        };
        let key_records: Arc<dyn KeyRecordQueries> = Arc::new(postgres_connection_info.clone());

        let handle = Self::new_with_parts(
            config,
            store,
            key_records,
            valkey_connection_info,
            postgres_connection_info,
        );
        spawn_background_tasks(
            &handle.app_state.pool,
            &handle.app_state.config,
            &handle.app_state.deferred_tasks,
            &handle.cancel_token,
        );
        Ok(handle)
    }

    /// Builds the state around already-constructed stores. No background tasks are started.
    pub fn new_with_parts(
        config: Arc<Config>,
        store: Arc<dyn BucketQueries>,
        key_records: Arc<dyn KeyRecordQueries>,
        valkey_connection_info: ValkeyConnectionInfo,
        postgres_connection_info: PostgresConnectionInfo,
    ) -> Self {
        let pool = KeyPool::new(store, key_records, &config);
        Self {
            app_state: AppStateData {
                config,
                pool,
                valkey_connection_info,
                postgres_connection_info,
                deferred_tasks: TaskTracker::new(),
            },
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stops the background tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.app_state.deferred_tasks.close();
        self.app_state.deferred_tasks.wait().await;
    }
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // Retrieve the request body as Bytes before deserializing it
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        // An empty body means "all defaults"
        let value = if bytes.is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            Json::<serde_json::Value>::from_bytes(&bytes)
                .map_err(|e| {
                    Error::new(ErrorDetails::InvalidRequest {
                        message: format!("{} ({})", e, e.status()),
                    })
                })?
                .0
        };

        // Now use `serde_path_to_error::deserialize` to attempt deserialization into `T`
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use serde::Deserialize;

    use super::*;
    use crate::db::InMemoryKeyRecords;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct CountBody {
        #[serde(default)]
        count: u32,
    }

    async fn extract(body: &'static str) -> Result<StructuredJson<CountBody>, Error> {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(body))
            .unwrap();
        StructuredJson::<CountBody>::from_request(request, &()).await
    }

    #[tokio::test]
    async fn test_structured_json_reports_path_of_bad_field() {
        assert_eq!(extract(r#"{"count": 3}"#).await.unwrap().0.count, 3);
        assert_eq!(extract("").await.unwrap().0.count, 0);

        let err = extract(r#"{"count": "three"}"#).await.err().unwrap();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::InvalidRequest { .. }
        ));
        assert!(err.to_string().contains("count"), "{err}");

        let err = extract("{not json").await.err().unwrap();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_background_tasks() {
        let handle = GatewayHandle::new_with_parts(
            Arc::new(Config::default()),
            Arc::new(MemoryBucketStore::new(Duration::from_secs(3600))),
            Arc::new(InMemoryKeyRecords::with_active([1])),
            ValkeyConnectionInfo::new_disabled(),
            PostgresConnectionInfo::new_disabled(),
        );
        spawn_background_tasks(
            &handle.app_state.pool,
            &handle.app_state.config,
            &handle.app_state.deferred_tasks,
            &handle.cancel_token,
        );
        assert_eq!(handle.app_state.deferred_tasks.len(), 1);
        handle.shutdown().await;
        assert!(handle.app_state.deferred_tasks.is_empty());
    }
}
