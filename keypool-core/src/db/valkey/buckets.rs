//! Valkey-backed token buckets.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionLike;
use serde::Deserialize;

use super::ValkeyConnectionInfo;
use crate::bucket::{BucketParams, BucketSnapshot, KeyId, millis_to_datetime, milli_to_tokens};
use crate::config::BucketStoreConfig;
use crate::db::{
    BucketPeek, BucketQueries, ConfigureMode, ConsumeReceipt, ConsumeRequest, EvictionReport,
    PeekRequest, ScanPage,
};
use crate::error::{Error, ErrorDetails};

/// Maximum number of buckets read by a single `keypool_peek_v1` call.
/// Larger batches are split and sent as one pipeline.
pub const PEEK_BATCH_SIZE: usize = 100;

/// Naming of bucket keys within the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketKeyspace {
    prefix: String,
    bucket_ttl_s: u64,
}

impl BucketKeyspace {
    pub fn new(prefix: impl Into<String>, bucket_ttl_s: u64) -> Self {
        Self {
            prefix: prefix.into(),
            bucket_ttl_s,
        }
    }

    fn bucket_prefix(&self) -> String {
        format!("{}:bucket:", self.prefix)
    }

    pub fn bucket_key(&self, key_id: KeyId) -> String {
        format!("{}:bucket:{key_id}", self.prefix)
    }

    pub fn lru_key(&self) -> String {
        format!("{}:bucket_lru", self.prefix)
    }

    fn scan_pattern(&self) -> String {
        format!("{}:bucket:*", self.prefix)
    }

    fn parse_key_id(&self, key: &str) -> Option<KeyId> {
        key.strip_prefix(&self.bucket_prefix())?
            .parse::<i64>()
            .ok()
            .map(KeyId)
    }
}

// Important: these types must match the JSON returned by the functions in lua/keypool_buckets.lua.

/// Response from keypool_consume_v1
#[derive(Debug, Deserialize)]
struct ConsumeResponse {
    consumed: bool,
    tokens: f64,
}

/// Response element from keypool_peek_v1, and response from keypool_configure_v1
#[derive(Debug, Deserialize)]
struct BucketResponse {
    exists: bool,
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill_ms: f64,
}

impl BucketResponse {
    fn into_snapshot(self, key_id: KeyId) -> BucketSnapshot {
        BucketSnapshot {
            key_id,
            capacity: milli_to_tokens(self.capacity as i64),
            tokens: milli_to_tokens(self.tokens as i64),
            refill_rate: milli_to_tokens(self.refill_rate as i64),
            last_refill_at: millis_to_datetime(self.last_refill_ms as i64),
        }
    }
}

/// Response from keypool_evict_v1
#[derive(Debug, Deserialize)]
struct EvictResponse {
    idle_evicted: u64,
    lru_evicted: u64,
    remaining: u64,
}

fn parse_response<T: for<'de> Deserialize<'de>>(function: &str, raw: &str) -> Result<T, Error> {
    serde_json::from_str(raw).map_err(|e| {
        Error::new(ErrorDetails::ValkeyQuery {
            message: format!("Failed to parse {function} response: {e}"),
        })
    })
}

async fn execute_consume<C: ConnectionLike>(
    conn: &mut C,
    keyspace: &BucketKeyspace,
    request: &ConsumeRequest,
) -> Result<ConsumeReceipt, Error> {
    let result: String = redis::cmd("FCALL")
        .arg("keypool_consume_v1")
        .arg(2) // numkeys
        .arg(keyspace.bucket_key(request.key_id))
        .arg(keyspace.lru_key())
        .arg(request.key_id.0)
        .arg(request.requested_milli)
        .arg(request.params.capacity_milli)
        .arg(request.params.refill_milli_per_sec)
        .arg(keyspace.bucket_ttl_s)
        .query_async(conn)
        .await?;

    let response: ConsumeResponse = parse_response("keypool_consume_v1", &result)?;
    Ok(ConsumeReceipt {
        key_id: request.key_id,
        consumed: response.consumed,
        tokens_remaining: milli_to_tokens(response.tokens as i64),
    })
}

fn peek_command(keyspace: &BucketKeyspace, requests: &[PeekRequest]) -> redis::Cmd {
    // Use FCALL_RO for read-only operations (works with replicas)
    let mut cmd = redis::cmd("FCALL_RO");
    cmd.arg("keypool_peek_v1").arg(requests.len());
    for request in requests {
        cmd.arg(keyspace.bucket_key(request.key_id));
    }
    for request in requests {
        cmd.arg(request.params.capacity_milli)
            .arg(request.params.refill_milli_per_sec);
    }
    cmd
}

fn peek_results(
    requests: &[PeekRequest],
    raw: &str,
) -> Result<impl Iterator<Item = BucketPeek>, Error> {
    let responses: Vec<BucketResponse> = parse_response("keypool_peek_v1", raw)?;
    if responses.len() != requests.len() {
        return Err(Error::new(ErrorDetails::ValkeyQuery {
            message: format!(
                "keypool_peek_v1 returned {} buckets for {} keys",
                responses.len(),
                requests.len()
            ),
        }));
    }
    Ok(requests
        .iter()
        .zip(responses)
        .map(|(request, response)| BucketPeek {
            exists: response.exists,
            snapshot: response.into_snapshot(request.key_id),
        }))
}

async fn execute_peek<C: ConnectionLike>(
    conn: &mut C,
    keyspace: &BucketKeyspace,
    requests: &[PeekRequest],
) -> Result<Vec<BucketPeek>, Error> {
    if requests.is_empty() {
        return Ok(vec![]);
    }

    if requests.len() <= PEEK_BATCH_SIZE {
        let raw: String = peek_command(keyspace, requests).query_async(conn).await?;
        return Ok(peek_results(requests, &raw)?.collect());
    }

    let mut pipe = redis::pipe();
    for chunk in requests.chunks(PEEK_BATCH_SIZE) {
        pipe.add_command(peek_command(keyspace, chunk));
    }
    let raw: Vec<String> = pipe.query_async(conn).await?;

    let mut peeks = Vec::with_capacity(requests.len());
    for (chunk, raw) in requests.chunks(PEEK_BATCH_SIZE).zip(raw.iter()) {
        peeks.extend(peek_results(chunk, raw)?);
    }
    Ok(peeks)
}

async fn execute_configure<C: ConnectionLike>(
    conn: &mut C,
    keyspace: &BucketKeyspace,
    key_id: KeyId,
    params: BucketParams,
    mode: ConfigureMode,
) -> Result<BucketSnapshot, Error> {
    let result: String = redis::cmd("FCALL")
        .arg("keypool_configure_v1")
        .arg(2) // numkeys
        .arg(keyspace.bucket_key(key_id))
        .arg(keyspace.lru_key())
        .arg(key_id.0)
        .arg(mode.as_str())
        .arg(params.capacity_milli)
        .arg(params.refill_milli_per_sec)
        .arg(keyspace.bucket_ttl_s)
        .query_async(conn)
        .await?;

    let response: BucketResponse = parse_response("keypool_configure_v1", &result)?;
    Ok(response.into_snapshot(key_id))
}

async fn execute_delete<C: ConnectionLike>(
    conn: &mut C,
    keyspace: &BucketKeyspace,
    key_ids: &[KeyId],
) -> Result<u64, Error> {
    let mut cmd = redis::cmd("FCALL");
    cmd.arg("keypool_delete_v1")
        .arg(key_ids.len() + 1)
        .arg(keyspace.lru_key());
    for key_id in key_ids {
        cmd.arg(keyspace.bucket_key(*key_id));
    }
    for key_id in key_ids {
        cmd.arg(key_id.0);
    }
    let deleted: u64 = cmd.query_async(conn).await?;
    Ok(deleted)
}

async fn execute_evict<C: ConnectionLike>(
    conn: &mut C,
    keyspace: &BucketKeyspace,
    idle_ttl: Duration,
    max_buckets: u64,
) -> Result<EvictionReport, Error> {
    let result: String = redis::cmd("FCALL")
        .arg("keypool_evict_v1")
        .arg(1) // numkeys
        .arg(keyspace.lru_key())
        .arg(keyspace.bucket_prefix())
        .arg(idle_ttl.as_millis() as u64)
        .arg(max_buckets)
        .query_async(conn)
        .await?;

    let response: EvictResponse = parse_response("keypool_evict_v1", &result)?;
    Ok(EvictionReport {
        idle_evicted: response.idle_evicted,
        lru_evicted: response.lru_evicted,
        remaining: response.remaining,
    })
}

/// Returns the next cursor and the key ids found on this page.
async fn execute_scan_keys<C: ConnectionLike>(
    conn: &mut C,
    keyspace: &BucketKeyspace,
    cursor: u64,
    count: usize,
) -> Result<(u64, Vec<KeyId>), Error> {
    let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(keyspace.scan_pattern())
        .arg("COUNT")
        .arg(count)
        .query_async(conn)
        .await?;

    let mut key_ids: Vec<KeyId> = keys
        .iter()
        .filter_map(|key| keyspace.parse_key_id(key))
        .collect();
    // SCAN may return a key more than once across pages
    key_ids.dedup();
    Ok((next, key_ids))
}

async fn execute_count<C: ConnectionLike>(
    conn: &mut C,
    keyspace: &BucketKeyspace,
) -> Result<u64, Error> {
    let count: u64 = redis::cmd("ZCARD")
        .arg(keyspace.lru_key())
        .query_async(conn)
        .await?;
    Ok(count)
}

/// Bucket store backed by the `keypool` function library.
#[derive(Clone, Debug)]
pub struct ValkeyBucketStore {
    connection_info: ValkeyConnectionInfo,
    keyspace: BucketKeyspace,
}

impl ValkeyBucketStore {
    pub fn new(connection_info: ValkeyConnectionInfo, config: &BucketStoreConfig) -> Self {
        Self {
            connection_info,
            keyspace: BucketKeyspace::new(config.key_prefix.clone(), config.bucket_ttl_s),
        }
    }

    pub fn connection_info(&self) -> &ValkeyConnectionInfo {
        &self.connection_info
    }

    fn connection(&self) -> Result<redis::aio::ConnectionManager, Error> {
        let connection = self.connection_info.get_connection().ok_or_else(|| {
            Error::new(ErrorDetails::ValkeyConnection {
                message: "Valkey connection is disabled".to_string(),
            })
        })?;
        Ok(connection.clone())
    }
}

#[async_trait]
impl BucketQueries for ValkeyBucketStore {
    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeReceipt, Error> {
        let mut conn = self.connection()?;
        execute_consume(&mut conn, &self.keyspace, &request).await
    }

    async fn peek(&self, requests: &[PeekRequest]) -> Result<Vec<BucketPeek>, Error> {
        if requests.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.connection()?;
        execute_peek(&mut conn, &self.keyspace, requests).await
    }

    async fn configure(
        &self,
        key_id: KeyId,
        params: BucketParams,
        mode: ConfigureMode,
    ) -> Result<BucketSnapshot, Error> {
        let mut conn = self.connection()?;
        execute_configure(&mut conn, &self.keyspace, key_id, params, mode).await
    }

    async fn delete(&self, key_ids: &[KeyId]) -> Result<u64, Error> {
        if key_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        execute_delete(&mut conn, &self.keyspace, key_ids).await
    }

    async fn evict(&self, idle_ttl: Duration, max_buckets: u64) -> Result<EvictionReport, Error> {
        let mut conn = self.connection()?;
        execute_evict(&mut conn, &self.keyspace, idle_ttl, max_buckets).await
    }

    async fn scan(&self, cursor: u64, count: usize) -> Result<ScanPage, Error> {
        let mut conn = self.connection()?;
        let (next, key_ids) = execute_scan_keys(&mut conn, &self.keyspace, cursor, count).await?;
        // Zero params: buckets that expired between SCAN and the read report `exists = false`
        let requests: Vec<PeekRequest> = key_ids
            .into_iter()
            .map(|key_id| PeekRequest {
                key_id,
                params: BucketParams {
                    capacity_milli: 0,
                    refill_milli_per_sec: 0,
                },
            })
            .collect();
        let snapshots = execute_peek(&mut conn, &self.keyspace, &requests)
            .await?
            .into_iter()
            .filter(|peek| peek.exists)
            .map(|peek| peek.snapshot)
            .collect();
        Ok(ScanPage {
            cursor: next,
            snapshots,
        })
    }

    async fn count(&self) -> Result<u64, Error> {
        let mut conn = self.connection()?;
        execute_count(&mut conn, &self.keyspace).await
    }
}
