//! Operator endpoints, mounted under `/admin` by the gateway.

use axum::Router;
use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post, put};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::admin::{CacheRefreshReport, CacheStatusReport};
use crate::bucket::KeyId;
use crate::bucket_manager::{BucketStatistics, BucketStatus, TierApplyReport};
use crate::config::{PriorityTier, TierConfig};
use crate::db::EvictionReport;
use crate::error::Error;
use crate::pool::{KeyEvent, KeyEventReport};
use crate::selection::{CandidatePoolHint, Selection};
use crate::utils::gateway::{AppState, AppStateData, StructuredJson};

pub fn admin_routes() -> Router<AppStateData> {
    Router::new()
        .route("/cache/status", get(cache_status_handler))
        .route("/cache/invalidate", post(invalidate_cache_handler))
        .route("/cache/refresh", post(refresh_cache_handler))
        .route("/cache/reset_statistics", post(reset_statistics_handler))
        .route("/buckets/statistics", get(bucket_statistics_handler))
        .route("/buckets/cleanup", post(cleanup_handler))
        .route("/buckets/{key_id}", get(bucket_status_handler))
        .route("/buckets/{key_id}/reset", post(reset_bucket_handler))
        .route("/buckets/{key_id}/configure", post(configure_bucket_handler))
        .route("/tiers/{tier}", put(update_tier_handler))
        .route("/tiers/{tier}/apply", post(apply_tier_handler))
        .route("/keys/events", post(key_event_handler))
        .route("/selection/test", post(test_selection_handler))
}

/// Capacity and refill rate supplied by an operator.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BucketParamsRequest {
    pub capacity: u32,
    pub refill_rate: f64,
}

fn parse_tier(tier: &str) -> Result<PriorityTier, Error> {
    tier.parse()
}

pub async fn cache_status_handler(
    State(app_state): AppState,
) -> Result<Json<CacheStatusReport>, Error> {
    Ok(Json(app_state.pool.get_cache_status().await?))
}

pub async fn invalidate_cache_handler(State(app_state): AppState) -> Result<Json<Value>, Error> {
    app_state.pool.invalidate_cache()?;
    Ok(Json(json!({ "invalidated": true })))
}

pub async fn refresh_cache_handler(
    State(app_state): AppState,
) -> Result<Json<CacheRefreshReport>, Error> {
    Ok(Json(app_state.pool.refresh_cache().await?))
}

pub async fn reset_statistics_handler(State(app_state): AppState) -> Json<Value> {
    app_state.pool.reset_statistics();
    Json(json!({ "reset": true }))
}

pub async fn bucket_statistics_handler(
    State(app_state): AppState,
) -> Result<Json<BucketStatistics>, Error> {
    Ok(Json(app_state.pool.buckets().statistics().await?))
}

pub async fn cleanup_handler(State(app_state): AppState) -> Result<Json<EvictionReport>, Error> {
    Ok(Json(app_state.pool.buckets().cleanup().await?))
}

pub async fn bucket_status_handler(
    State(app_state): AppState,
    Path(key_id): Path<KeyId>,
) -> Result<Json<BucketStatus>, Error> {
    Ok(Json(app_state.pool.buckets().bucket_status(key_id).await?))
}

pub async fn reset_bucket_handler(
    State(app_state): AppState,
    Path(key_id): Path<KeyId>,
) -> Result<Json<BucketStatus>, Error> {
    Ok(Json(app_state.pool.buckets().reset_bucket(key_id).await?))
}

pub async fn configure_bucket_handler(
    State(app_state): AppState,
    Path(key_id): Path<KeyId>,
    StructuredJson(params): StructuredJson<BucketParamsRequest>,
) -> Result<Json<BucketStatus>, Error> {
    Ok(Json(
        app_state
            .pool
            .buckets()
            .configure_bucket(key_id, params.capacity, params.refill_rate)
            .await?,
    ))
}

/// Changes the defaults for a tier. Existing buckets are untouched until the tier is applied.
pub async fn update_tier_handler(
    State(app_state): AppState,
    Path(tier): Path<String>,
    StructuredJson(params): StructuredJson<BucketParamsRequest>,
) -> Result<Json<TierConfig>, Error> {
    let tier = parse_tier(&tier)?;
    Ok(Json(app_state.pool.buckets().set_tier_config(
        tier,
        params.capacity,
        params.refill_rate,
    )?))
}

pub async fn apply_tier_handler(
    State(app_state): AppState,
    Path(tier): Path<String>,
) -> Result<Json<TierApplyReport>, Error> {
    let tier = parse_tier(&tier)?;
    Ok(Json(app_state.pool.reconfigure_tier(tier).await?))
}

pub async fn key_event_handler(
    State(app_state): AppState,
    StructuredJson(event): StructuredJson<KeyEvent>,
) -> Result<Json<KeyEventReport>, Error> {
    Ok(Json(app_state.pool.handle_key_event(event).await?))
}

/// Runs one real selection, reserving tokens like a proxied request would.
pub async fn test_selection_handler(
    State(app_state): AppState,
    StructuredJson(hint): StructuredJson<CandidatePoolHint>,
) -> Result<Json<Selection>, Error> {
    Ok(Json(app_state.pool.select_key(&hint).await?))
}
