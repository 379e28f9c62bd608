use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::instrument;

use super::{
    DbError, DbResult, Document, DocumentStore, ExpiryFilter, Fields, MAX_BATCH_SIZE, timestamp_of,
};
use crate::config::SqliteConfig;

/// SQLite-backed document store.
///
/// Document bodies are stored as JSON text; merges use `json_patch` so a
/// merge is a single statement. `ts` holds the `timestamp` field in whole
/// milliseconds and is recomputed whenever a write carries that field.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(cfg: &SqliteConfig) -> DbResult<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect_with(
                sqlx::sqlite::SqliteConnectOptions::new()
                    .filename(&cfg.path)
                    .create_if_missing(cfg.create_if_missing)
                    .journal_mode(if cfg.wal_mode {
                        sqlx::sqlite::SqliteJournalMode::Wal
                    } else {
                        sqlx::sqlite::SqliteJournalMode::Delete
                    })
                    .busy_timeout(std::time::Duration::from_millis(cfg.busy_timeout_ms)),
            )
            .await?;

        if cfg.run_migrations {
            run_migrations(&pool).await?;
        }

        tracing::info!(path = %cfg.path, "Connected to SQLite document store");
        Ok(Self::new(pool))
    }
}

pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
    Ok(())
}

fn ts_millis(fields: &Fields) -> Option<i64> {
    timestamp_of(fields).map(|ts| ts.timestamp_millis())
}

fn parse_body(raw: &str) -> DbResult<Fields> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    #[instrument(skip(self))]
    async fn get(&self, collection: &str, id: &str) -> DbResult<Option<Document>> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT data FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|raw| {
            Ok(Document {
                id: id.to_string(),
                data: parse_body(&raw)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, fields))]
    async fn merge(&self, collection: &str, id: &str, fields: Fields) -> DbResult<()> {
        let ts = ts_millis(&fields);
        let body = serde_json::to_string(&fields)?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, ts)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                data = json_patch(documents.data, excluded.data),
                ts = CASE
                    WHEN json_type(excluded.data, '$.timestamp') IS NOT NULL THEN excluded.ts
                    ELSE documents.ts
                END
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, fields))]
    async fn append(&self, collection: &str, fields: Fields) -> DbResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = ts_millis(&fields);
        let body = serde_json::to_string(&fields)?;

        sqlx::query("INSERT INTO documents (collection, id, data, ts) VALUES (?, ?, ?, ?)")
            .bind(collection)
            .bind(&id)
            .bind(body)
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
        let body = serde_json::to_string(&fields)?;
        let guard_path = format!("$.{guard_field}");

        // The guard is evaluated by the UPDATE itself, so two concurrent
        // claims cannot both see the flag unset.
        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET data = json_patch(data, ?1),
                ts = CASE WHEN json_type(?1, '$.timestamp') IS NOT NULL THEN ?2 ELSE ts END
            WHERE collection = ?3 AND id = ?4
              AND json_type(data, ?5) IS NOT 'true'
            "#,
        )
        .bind(&body)
        .bind(ts)
        .bind(collection)
        .bind(id)
        .bind(&guard_path)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(true);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, ts)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (collection, id) DO NOTHING
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(&body)
        .bind(ts)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted > 0)
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
                    WHERE collection = ? AND ts < ?
                    ORDER BY ts, id
                    LIMIT ?
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
                    "SELECT id FROM documents WHERE collection = ? ORDER BY ts, id LIMIT ?",
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
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ? AND ts < ?")
                    .bind(collection)
                    .bind(cutoff.timestamp_millis())
                    .fetch_one(&self.pool)
                    .await?
            }
            ExpiryFilter::All => {
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
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

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn list_recent(&self, collection: &str, limit: usize) -> DbResult<Vec<Document>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, data FROM documents
            WHERE collection = ?
            ORDER BY ts IS NULL, ts DESC
            LIMIT ?
            "#,
        )
        .bind(collection)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, raw)| {
                Ok(Document {
                    id,
                    data: parse_body(&raw)?,
                })
            })
            .collect()
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
