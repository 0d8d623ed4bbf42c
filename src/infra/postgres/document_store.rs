//! PostgreSQL document store
//!
//! Every read-model collection is one table. Version fields are real columns
//! so write guards run inside the `WHERE` clause of a single statement; the
//! business body is stored as `JSONB`.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, FromRow};
use tracing::{debug, instrument};

use crate::domain::{DocumentVersion, Position, ReadModelDocument, ReadModelState, Signature};
use crate::infra::{
    BulkWriteFailure, BulkWriteResult, DocumentStore, FaultMarker, ProjectionError, Result,
    VersionUpdate, WriteGuard, WriteOperation,
};

/// PostgreSQL-backed document store, one table per collection
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create from connection string
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Quoted table name; collection names are interpolated into SQL, so only
    /// plain identifiers are accepted.
    fn table(collection: &str) -> Result<String> {
        let valid = !collection.is_empty()
            && collection.len() <= 63
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !collection.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(ProjectionError::Configuration(format!(
                "invalid collection name: {collection:?}"
            )));
        }
        Ok(format!("\"{collection}\""))
    }

    async fn insert_one(&self, collection: &str, document: &ReadModelDocument) -> Result<()> {
        let table = Self::table(collection)?;
        let state = &document.state;

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (
                id, aggregate_version, readmodel_version, projected_position,
                last_processed_versions, faulted, fault_retry_count, last_error,
                last_processed_at, body
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#
        ))
        .bind(&state.id)
        .bind(state.aggregate_version)
        .bind(state.readmodel_version)
        .bind(state.projected_position)
        .bind(&state.last_processed_versions)
        .bind(state.faulted)
        .bind(retry_count_to_db(state.fault_retry_count))
        .bind(&state.last_error)
        .bind(state.last_processed_at)
        .bind(&document.body)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(ProjectionError::DuplicateKey {
                    collection: collection.to_string(),
                    id: state.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_one(
        &self,
        collection: &str,
        document: &ReadModelDocument,
        guard: WriteGuard,
    ) -> Result<bool> {
        let table = Self::table(collection)?;
        let state = &document.state;

        let result = sqlx::query(&format!(
            r#"
            UPDATE {table} SET
                aggregate_version = $2,
                readmodel_version = $3,
                projected_position = $4,
                last_processed_versions = $5,
                faulted = $6,
                fault_retry_count = $7,
                last_error = $8,
                last_processed_at = $9,
                body = $10
            WHERE id = $1
              AND readmodel_version <= $12
              AND (
                    NOT $13
                    OR aggregate_version < $11
                    OR (aggregate_version = $11 AND readmodel_version < $12)
              )
            "#
        ))
        .bind(&state.id)
        .bind(state.aggregate_version)
        .bind(state.readmodel_version)
        .bind(state.projected_position)
        .bind(&state.last_processed_versions)
        .bind(state.faulted)
        .bind(retry_count_to_db(state.fault_retry_count))
        .bind(&state.last_error)
        .bind(state.last_processed_at)
        .bind(&document.body)
        .bind(guard.aggregate_version)
        .bind(guard.readmodel_version)
        .bind(guard.require_newer)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_version_one(&self, collection: &str, update: &VersionUpdate) -> Result<bool> {
        let table = Self::table(collection)?;

        let result = sqlx::query(&format!(
            r#"
            UPDATE {table} SET
                aggregate_version = $2,
                projected_position = $3,
                last_processed_versions = $4
            WHERE id = $1
              AND aggregate_version < $2
              AND readmodel_version <= $5
            "#
        ))
        .bind(&update.id)
        .bind(update.aggregate_version)
        .bind(update.projected_position)
        .bind(&update.last_processed_versions)
        .bind(update.readmodel_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `INSERT .. SELECT FROM UNNEST(..) ON CONFLICT DO NOTHING`; returns the
    /// ids actually inserted
    async fn insert_many(
        &self,
        table: &str,
        documents: &[ReadModelDocument],
    ) -> Result<HashSet<String>> {
        let columns = DocumentColumns::new(documents.iter());

        let inserted: Vec<(String,)> = sqlx::query_as(&format!(
            r#"
            INSERT INTO {table} (
                id, aggregate_version, readmodel_version, projected_position,
                last_processed_versions, faulted, fault_retry_count, last_error,
                last_processed_at, body
            )
            SELECT c.id, c.aggregate_version, c.readmodel_version, c.projected_position,
                   {versions}, c.faulted, c.fault_retry_count, c.last_error,
                   c.last_processed_at, c.body
            FROM UNNEST(
                $1::text[], $2::bigint[], $3::int[], $4::bigint[], $5::jsonb[],
                $6::boolean[], $7::int[], $8::text[], $9::timestamptz[], $10::jsonb[]
            ) AS c(
                id, aggregate_version, readmodel_version, projected_position, versions,
                faulted, fault_retry_count, last_error, last_processed_at, body
            )
            ON CONFLICT (id) DO NOTHING
            RETURNING id
            "#,
            versions = VERSIONS_FROM_JSONB,
        ))
        .bind(&columns.ids)
        .bind(&columns.aggregate_versions)
        .bind(&columns.readmodel_versions)
        .bind(&columns.positions)
        .bind(&columns.versions)
        .bind(&columns.faulted)
        .bind(&columns.retries)
        .bind(&columns.errors)
        .bind(&columns.processed_at)
        .bind(&columns.bodies)
        .fetch_all(&self.pool)
        .await?;

        Ok(inserted.into_iter().map(|(id,)| id).collect())
    }

    /// One guarded `UPDATE .. FROM UNNEST(..)`; returns the rows replaced
    async fn replace_many(
        &self,
        table: &str,
        replaces: &[(ReadModelDocument, WriteGuard)],
    ) -> Result<usize> {
        let columns = DocumentColumns::new(replaces.iter().map(|(d, _)| d));
        let guard_versions: Vec<i64> = replaces.iter().map(|(_, g)| g.aggregate_version).collect();
        let guard_signatures: Vec<i32> =
            replaces.iter().map(|(_, g)| g.readmodel_version).collect();
        let require_newer: Vec<bool> = replaces.iter().map(|(_, g)| g.require_newer).collect();

        let result = sqlx::query(&format!(
            r#"
            UPDATE {table} AS t SET
                aggregate_version = c.aggregate_version,
                readmodel_version = c.readmodel_version,
                projected_position = c.projected_position,
                last_processed_versions = {versions},
                faulted = c.faulted,
                fault_retry_count = c.fault_retry_count,
                last_error = c.last_error,
                last_processed_at = c.last_processed_at,
                body = c.body
            FROM UNNEST(
                $1::text[], $2::bigint[], $3::int[], $4::bigint[], $5::jsonb[],
                $6::boolean[], $7::int[], $8::text[], $9::timestamptz[], $10::jsonb[],
                $11::bigint[], $12::int[], $13::boolean[]
            ) AS c(
                id, aggregate_version, readmodel_version, projected_position, versions,
                faulted, fault_retry_count, last_error, last_processed_at, body,
                guard_version, guard_signature, require_newer
            )
            WHERE t.id = c.id
              AND t.readmodel_version <= c.guard_signature
              AND (
                    NOT c.require_newer
                    OR t.aggregate_version < c.guard_version
                    OR (t.aggregate_version = c.guard_version
                        AND t.readmodel_version < c.guard_signature)
              )
            "#,
            versions = VERSIONS_FROM_JSONB,
        ))
        .bind(&columns.ids)
        .bind(&columns.aggregate_versions)
        .bind(&columns.readmodel_versions)
        .bind(&columns.positions)
        .bind(&columns.versions)
        .bind(&columns.faulted)
        .bind(&columns.retries)
        .bind(&columns.errors)
        .bind(&columns.processed_at)
        .bind(&columns.bodies)
        .bind(&guard_versions)
        .bind(&guard_signatures)
        .bind(&require_newer)
        .execute(&self.pool)
        .await?;

        Ok(rows_to_count(result.rows_affected()))
    }

    /// One guarded version-only `UPDATE .. FROM UNNEST(..)`
    async fn update_version_many(&self, table: &str, updates: &[VersionUpdate]) -> Result<usize> {
        let ids: Vec<&str> = updates.iter().map(|u| u.id.as_str()).collect();
        let versions: Vec<i64> = updates.iter().map(|u| u.aggregate_version).collect();
        let positions: Vec<i64> = updates.iter().map(|u| u.projected_position).collect();
        let processed: Vec<serde_json::Value> = updates
            .iter()
            .map(|u| serde_json::Value::from(u.last_processed_versions.clone()))
            .collect();
        let signatures: Vec<i32> = updates.iter().map(|u| u.readmodel_version).collect();

        let result = sqlx::query(&format!(
            r#"
            UPDATE {table} AS t SET
                aggregate_version = c.aggregate_version,
                projected_position = c.projected_position,
                last_processed_versions = {versions}
            FROM UNNEST($1::text[], $2::bigint[], $3::bigint[], $4::jsonb[], $5::int[])
                AS c(id, aggregate_version, projected_position, versions, readmodel_version)
            WHERE t.id = c.id
              AND t.aggregate_version < c.aggregate_version
              AND t.readmodel_version <= c.readmodel_version
            "#,
            versions = VERSIONS_FROM_JSONB,
        ))
        .bind(&ids)
        .bind(&versions)
        .bind(&positions)
        .bind(&processed)
        .bind(&signatures)
        .execute(&self.pool)
        .await?;

        Ok(rows_to_count(result.rows_affected()))
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[instrument(skip(self))]
    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let table = Self::table(collection)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                aggregate_version BIGINT NOT NULL,
                readmodel_version INT NOT NULL,
                projected_position BIGINT NOT NULL,
                last_processed_versions BIGINT[] NOT NULL DEFAULT '{{}}',
                faulted BOOLEAN NOT NULL DEFAULT FALSE,
                fault_retry_count INT NOT NULL DEFAULT 0,
                last_error TEXT,
                last_processed_at TIMESTAMPTZ,
                body JSONB NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS "idx_{collection}_fixer"
            ON {table} (projected_position, readmodel_version, id)
            "#
        ))
        .execute(&self.pool)
        .await?;

        debug!(collection = collection, "Collection ready");
        Ok(())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<ReadModelDocument>> {
        let table = Self::table(collection)?;

        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            SELECT id, aggregate_version, readmodel_version, projected_position,
                   last_processed_versions, faulted, fault_retry_count, last_error,
                   last_processed_at, body
            FROM {table}
            WHERE id = $1
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DocumentRow::into_document))
    }

    async fn find_versions(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<DocumentVersion>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = Self::table(collection)?;

        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            r#"
            SELECT id, aggregate_version, readmodel_version, projected_position
            FROM {table}
            WHERE id = ANY($1)
            "#
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert(&self, collection: &str, document: &ReadModelDocument) -> Result<()> {
        self.insert_one(collection, document).await
    }

    async fn replace_if(
        &self,
        collection: &str,
        document: &ReadModelDocument,
        guard: WriteGuard,
    ) -> Result<bool> {
        self.replace_one(collection, document, guard).await
    }

    async fn update_version_if(&self, collection: &str, update: &VersionUpdate) -> Result<bool> {
        self.update_version_one(collection, update).await
    }

    async fn mark_faulted_if(&self, collection: &str, marker: &FaultMarker) -> Result<bool> {
        let table = Self::table(collection)?;

        let result = sqlx::query(&format!(
            r#"
            UPDATE {table} SET
                faulted = TRUE,
                last_error = $4,
                fault_retry_count = fault_retry_count + CASE WHEN $5 THEN 1 ELSE 0 END
            WHERE id = $1
              AND aggregate_version = $2
              AND readmodel_version = $3
            "#
        ))
        .bind(&marker.id)
        .bind(marker.aggregate_version)
        .bind(marker.readmodel_version)
        .bind(&marker.last_error)
        .bind(marker.increment_retry)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// At most one statement per operation kind. A statement that fails
    /// reports every item it carried; the other kinds still run.
    #[instrument(skip(self, operations), fields(count = operations.len()))]
    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteOperation>,
    ) -> Result<BulkWriteResult> {
        let table = Self::table(collection)?;
        let mut inserts = Vec::new();
        let mut replaces = Vec::new();
        let mut updates = Vec::new();
        for operation in operations {
            match operation {
                WriteOperation::Insert(document) => inserts.push(document),
                WriteOperation::Replace { document, guard } => replaces.push((document, guard)),
                WriteOperation::UpdateVersion(update) => updates.push(update),
            }
        }

        let mut result = BulkWriteResult::default();

        if !inserts.is_empty() {
            match self.insert_many(&table, &inserts).await {
                Ok(inserted) => {
                    result.inserted = inserted.len();
                    for document in &inserts {
                        if !inserted.contains(&document.state.id) {
                            result.failures.push(BulkWriteFailure {
                                id: document.state.id.clone(),
                                duplicate_key: true,
                                message: format!("duplicate id in {collection}"),
                            });
                        }
                    }
                }
                Err(e) => fail_all(&mut result, inserts.iter().map(|d| d.id()), &e),
            }
        }

        if !replaces.is_empty() {
            match self.replace_many(&table, &replaces).await {
                Ok(modified) => {
                    result.modified += modified;
                    result.unmatched += replaces.len().saturating_sub(modified);
                }
                Err(e) => fail_all(&mut result, replaces.iter().map(|(d, _)| d.id()), &e),
            }
        }

        if !updates.is_empty() {
            match self.update_version_many(&table, &updates).await {
                Ok(modified) => {
                    result.modified += modified;
                    result.unmatched += updates.len().saturating_sub(modified);
                }
                Err(e) => fail_all(&mut result, updates.iter().map(|u| u.id.as_str()), &e),
            }
        }

        debug!(
            inserted = result.inserted,
            modified = result.modified,
            unmatched = result.unmatched,
            failed = result.failures.len(),
            "Bulk write applied"
        );
        Ok(result)
    }

    async fn find_stale(
        &self,
        collection: &str,
        signature: Signature,
        after_position: Position,
        limit: usize,
    ) -> Result<Vec<DocumentVersion>> {
        let table = Self::table(collection)?;

        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            r#"
            SELECT id, aggregate_version, readmodel_version, projected_position
            FROM {table}
            WHERE readmodel_version < $1
              AND projected_position > $2
            ORDER BY projected_position ASC, readmodel_version ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(signature)
        .bind(after_position)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

fn retry_count_to_db(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn rows_to_count(rows: u64) -> usize {
    usize::try_from(rows).unwrap_or(usize::MAX)
}

/// `BIGINT[]` from the per-row JSONB array `c.versions`, keeping element order.
/// Row arrays travel as JSONB because `UNNEST` flattens nested SQL arrays.
const VERSIONS_FROM_JSONB: &str = "ARRAY(SELECT e.v::bigint \
     FROM jsonb_array_elements_text(c.versions) WITH ORDINALITY AS e(v, n) ORDER BY e.n)";

fn fail_all<'a>(
    result: &mut BulkWriteResult,
    ids: impl Iterator<Item = &'a str>,
    error: &ProjectionError,
) {
    for id in ids {
        result.failures.push(BulkWriteFailure {
            id: id.to_string(),
            duplicate_key: matches!(error, ProjectionError::DuplicateKey { .. }),
            message: error.to_string(),
        });
    }
}

/// Column-wise view of documents for `UNNEST` binds
struct DocumentColumns {
    ids: Vec<String>,
    aggregate_versions: Vec<i64>,
    readmodel_versions: Vec<i32>,
    positions: Vec<i64>,
    versions: Vec<serde_json::Value>,
    faulted: Vec<bool>,
    retries: Vec<i32>,
    errors: Vec<Option<String>>,
    processed_at: Vec<Option<DateTime<Utc>>>,
    bodies: Vec<serde_json::Value>,
}

impl DocumentColumns {
    fn new<'a>(documents: impl Iterator<Item = &'a ReadModelDocument>) -> Self {
        let mut columns = Self {
            ids: Vec::new(),
            aggregate_versions: Vec::new(),
            readmodel_versions: Vec::new(),
            positions: Vec::new(),
            versions: Vec::new(),
            faulted: Vec::new(),
            retries: Vec::new(),
            errors: Vec::new(),
            processed_at: Vec::new(),
            bodies: Vec::new(),
        };
        for document in documents {
            let state = &document.state;
            columns.ids.push(state.id.clone());
            columns.aggregate_versions.push(state.aggregate_version);
            columns.readmodel_versions.push(state.readmodel_version);
            columns.positions.push(state.projected_position);
            columns
                .versions
                .push(serde_json::Value::from(state.last_processed_versions.clone()));
            columns.faulted.push(state.faulted);
            columns.retries.push(retry_count_to_db(state.fault_retry_count));
            columns.errors.push(state.last_error.clone());
            columns.processed_at.push(state.last_processed_at);
            columns.bodies.push(document.body.clone());
        }
        columns
    }
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: String,
    aggregate_version: i64,
    readmodel_version: i32,
    projected_position: i64,
    last_processed_versions: Vec<i64>,
    faulted: bool,
    fault_retry_count: i32,
    last_error: Option<String>,
    last_processed_at: Option<DateTime<Utc>>,
    body: serde_json::Value,
}

impl DocumentRow {
    fn into_document(self) -> ReadModelDocument {
        ReadModelDocument {
            state: ReadModelState {
                id: self.id,
                aggregate_version: self.aggregate_version,
                projected_position: self.projected_position,
                last_processed_versions: self.last_processed_versions,
                readmodel_version: self.readmodel_version,
                faulted: self.faulted,
                fault_retry_count: u32::try_from(self.fault_retry_count).unwrap_or(0),
                last_error: self.last_error,
                last_processed_at: self.last_processed_at,
            },
            body: self.body,
        }
    }
}

#[derive(Debug, FromRow)]
struct VersionRow {
    id: String,
    aggregate_version: i64,
    readmodel_version: i32,
    projected_position: i64,
}

impl From<VersionRow> for DocumentVersion {
    fn from(row: VersionRow) -> Self {
        DocumentVersion {
            id: row.id,
            aggregate_version: row.aggregate_version,
            readmodel_version: row.readmodel_version,
            projected_position: row.projected_position,
        }
    }
}
