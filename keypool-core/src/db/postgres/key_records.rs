use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::Row;

use crate::bucket::KeyId;
use crate::config::PriorityTier;
use crate::db::KeyRecordQueries;
use crate::db::postgres::PostgresConnectionInfo;
use crate::error::Error;

#[async_trait]
impl KeyRecordQueries for PostgresConnectionInfo {
    async fn list_active_key_ids(&self) -> Result<Vec<KeyId>, Error> {
        let pool = self.get_pool_result()?;

        let ids: Vec<i64> =
            sqlx::query_scalar(r"SELECT id FROM api_keys WHERE status = 'active' ORDER BY id")
                .fetch_all(pool)
                .await?;

        Ok(ids.into_iter().map(KeyId).collect())
    }

    async fn get_key_tier(&self, key_id: KeyId) -> Result<PriorityTier, Error> {
        let pool = self.get_pool_result()?;

        let row = sqlx::query(r"SELECT priority FROM api_keys WHERE id = $1 LIMIT 1")
            .bind(key_id.0)
            .fetch_optional(pool)
            .await?;

        let Some(row) = row else {
            return Ok(PriorityTier::default());
        };
        let priority: Option<String> = row.try_get("priority")?;
        Ok(PriorityTier::from_record(priority.as_deref()))
    }

    async fn get_key_tiers(
        &self,
        key_ids: &[KeyId],
    ) -> Result<HashMap<KeyId, PriorityTier>, Error> {
        if key_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let pool = self.get_pool_result()?;

        let ids: Vec<i64> = key_ids.iter().map(|id| id.0).collect();
        let rows = sqlx::query(r"SELECT id, priority FROM api_keys WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(pool)
            .await?;

        let mut tiers = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let priority: Option<String> = row.try_get("priority")?;
            tiers.insert(KeyId(id), PriorityTier::from_record(priority.as_deref()));
        }
        Ok(tiers)
    }
}
