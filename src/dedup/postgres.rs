//! Postgres-backed cooldown records
//!
//! One row per item in `cooldown_records`; see `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use tracing::instrument;

use super::CooldownStore;
use crate::error::Result;
use crate::model::CooldownRecord;

#[derive(Clone)]
pub struct PgCooldownStore {
    pool: PgPool,
}

impl PgCooldownStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CooldownStore for PgCooldownStore {
    async fn get(&self, id: &str) -> Result<Option<CooldownRecord>> {
        let row = sqlx::query(
            "SELECT item_id, last_surfaced FROM cooldown_records WHERE item_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(CooldownRecord {
                id: r.try_get("item_id")?,
                last_surfaced: r.try_get("last_surfaced")?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            "SELECT item_id, last_surfaced FROM cooldown_records WHERE item_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            found.insert(row.try_get("item_id")?, row.try_get("last_surfaced")?);
        }
        Ok(found)
    }

    async fn set(&self, record: CooldownRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cooldown_records (item_id, last_surfaced)
            VALUES ($1, $2)
            ON CONFLICT (item_id) DO UPDATE
            SET last_surfaced = GREATEST(cooldown_records.last_surfaced, EXCLUDED.last_surfaced)
            "#,
        )
        .bind(&record.id)
        .bind(record.last_surfaced)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cooldown_records WHERE last_surfaced < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
