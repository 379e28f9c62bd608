use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;

use super::{
    DbError, DbResult, Document, DocumentStore, ExpiryFilter, Fields, MAX_BATCH_SIZE, timestamp_of,
};
use crate::config::PostgresConfig;

/// PostgreSQL-backed document store.
///
/// Document bodies live in a JSONB column; merges use the `||` operator.
/// `ts` holds the `timestamp` field in whole milliseconds and is recomputed
/// whenever a write carries that field.
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(cfg: &PostgresConfig) -> DbResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .min_connections(cfg.min_connections)
            .max_connections(cfg.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(cfg.connect_timeout_secs))
            .connect(&cfg.url)
            .await?;

        if cfg.run_migrations {
            sqlx::migrate!("./migrations_sqlx/postgres").run(&pool).await?;
        }

        tracing::info!("Connected to PostgreSQL document store");
        Ok(Self::new(pool))
    }
}

fn ts_millis(fields: &Fields) -> Option<i64> {
    timestamp_of(fields).map(|ts| ts.timestamp_millis())
}

fn into_fields(value: Value) -> DbResult<Fields> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DbError::Internal(format!(
            "stored document is not an object: {other}"
        ))),
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self))]
    async fn get(&self, collection: &str, id: &str) -> DbResult<Option<Document>> {
        let row: Option<Value> =
            sqlx::query_scalar("SELECT data FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|value| {
            Ok(Document {
                id: id.to_string(),
                data: into_fields(value)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, fields))]
    async fn merge(&self, collection: &str, id: &str, fields: Fields) -> DbResult<()> {
        let ts = ts_millis(&fields);

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, ts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (collection, id) DO UPDATE SET
                data = documents.data || excluded.data,
                ts = CASE
                    WHEN excluded.data -> 'timestamp' IS NOT NULL THEN excluded.ts
                    ELSE documents.ts
                END
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Value::Object(fields))
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, fields))]
    async fn append(&self, collection: &str, fields: Fields) -> DbResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = ts_millis(&fields);

        sqlx::query("INSERT INTO documents (collection, id, data, ts) VALUES ($1, $2, $3, $4)")
            .bind(collection)
            .bind(&id)
            .bind(Value::Object(fields))
            .bind(ts)
            .execute(&self.pool)
            .await?;

        Ok(id)
    }

    #[instrument(skip(self, fields))]
    async fn merge_unless_set(
        &self,
        collection: &str,
        id: &str,
        guard_field: &str,
        fields: Fields,
    ) -> DbResult<bool> {
        let ts = ts_millis(&fields);
        let body = Value::Object(fields);

        // Single-statement upsert: the conflict branch only fires when the
        // guard is not already `true`.
        let applied = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, ts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (collection, id) DO UPDATE SET
                data = documents.data || excluded.data,
                ts = CASE
                    WHEN excluded.data -> 'timestamp' IS NOT NULL THEN excluded.ts
                    ELSE documents.ts
                END
            WHERE (documents.data -> $5::text) IS DISTINCT FROM 'true'::jsonb
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .bind(ts)
        .bind(guard_field)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(applied > 0)
    }

    #[instrument(skip(self))]
    async fn list_expired(
        &self,
        collection: &str,
        filter: ExpiryFilter,
        limit: usize,
    ) -> DbResult<Vec<String>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ids = match filter {
            ExpiryFilter::Before(cutoff) => {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM documents
                    WHERE collection = $1 AND ts < $2
                    ORDER BY ts, id
                    LIMIT $3
                    "#,
                )
                .bind(collection)
                .bind(cutoff.timestamp_millis())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            ExpiryFilter::All => {
                sqlx::query_scalar(
                    "SELECT id FROM documents WHERE collection = $1 ORDER BY ts, id LIMIT $2",
                )
                .bind(collection)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn count_expired(&self, collection: &str, filter: ExpiryFilter) -> DbResult<u64> {
        let count: i64 = match filter {
            ExpiryFilter::Before(cutoff) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM documents WHERE collection = $1 AND ts < $2",
                )
                .bind(collection)
                .bind(cutoff.timestamp_millis())
                .fetch_one(&self.pool)
                .await?
            }
            ExpiryFilter::All => {
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = $1")
                    .bind(collection)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, ids), fields(batch = ids.len()))]
    async fn delete_batch(&self, collection: &str, ids: &[String]) -> DbResult<u64> {
        if ids.len() > MAX_BATCH_SIZE {
            return Err(DbError::Validation(format!(
                "batch of {} exceeds the limit of {MAX_BATCH_SIZE}",
                ids.len()
            )));
        }

        let removed = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = ANY($2)")
            .bind(collection)
            .bind(ids)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn list_recent(&self, collection: &str, limit: usize) -> DbResult<Vec<Document>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT id, data FROM documents
            WHERE collection = $1
            ORDER BY ts DESC NULLS LAST
            LIMIT $2
            "#,
        )
        .bind(collection)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, value)| {
                Ok(Document {
                    id,
                    data: into_fields(value)?,
                })
            })
            .collect()
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
