//! PostgreSQL checkpoint store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, FromRow};
use tracing::instrument;

use crate::domain::CheckpointRecord;
use crate::infra::{CheckpointStore, Result};

/// One row per read-model name in `readmodel_checkpoints`
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create from connection string
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Initialize the checkpoint table
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS readmodel_checkpoints (
                name TEXT PRIMARY KEY,
                position BIGINT NOT NULL DEFAULT 0,
                readmodel_missing BOOLEAN NOT NULL DEFAULT FALSE,
                catchup_done BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load_all(&self) -> Result<Vec<CheckpointRecord>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT name, position, readmodel_missing, catchup_done, updated_at
            FROM readmodel_checkpoints
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Single `INSERT .. SELECT UNNEST(..) ON CONFLICT` statement for all
    /// records; a stored position is never lowered
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_many(&self, records: &[CheckpointRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
        let positions: Vec<i64> = records.iter().map(|r| r.position).collect();
        let missing: Vec<bool> = records.iter().map(|r| r.readmodel_missing).collect();
        let catchup: Vec<bool> = records.iter().map(|r| r.catchup_done).collect();
        let updated: Vec<DateTime<Utc>> = records.iter().map(|r| r.updated_at).collect();

        sqlx::query(
            r#"
            INSERT INTO readmodel_checkpoints (
                name, position, readmodel_missing, catchup_done, updated_at
            )
            SELECT * FROM UNNEST(
                $1::text[], $2::bigint[], $3::boolean[], $4::boolean[], $5::timestamptz[]
            )
            ON CONFLICT (name) DO UPDATE SET
                position = GREATEST(readmodel_checkpoints.position, EXCLUDED.position),
                readmodel_missing = EXCLUDED.readmodel_missing,
                catchup_done = EXCLUDED.catchup_done,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&names)
        .bind(&positions)
        .bind(&missing)
        .bind(&catchup)
        .bind(&updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct CheckpointRow {
    name: String,
    position: i64,
    readmodel_missing: bool,
    catchup_done: bool,
    updated_at: DateTime<Utc>,
}

impl From<CheckpointRow> for CheckpointRecord {
    fn from(row: CheckpointRow) -> Self {
        CheckpointRecord {
            name: row.name,
            position: row.position,
            readmodel_missing: row.readmodel_missing,
            catchup_done: row.catchup_done,
            updated_at: row.updated_at,
        }
    }
}
