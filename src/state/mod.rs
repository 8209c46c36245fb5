//! Per-source sync state, backed by a schema-qualified Postgres table
//!
//! `sync_state` keys on `(source, pg_id)` and is the sole link between
//! upstream rows and vector-store ids. `updated_at` is set server-side
//! on every write, so `max_updated_at` doubles as the source watermark.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::debug;

const SYNC_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS {schema}.sync_state (
    source TEXT NOT NULL,
    pg_id TEXT NOT NULL,
    text_hash TEXT,
    embedding_version TEXT,
    vector_id BIGINT,
    nsfw_score REAL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_error TEXT,
    PRIMARY KEY (source, pg_id)
);
"#;

const SYNC_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_sync_state_updated_at ON {schema}.sync_state (updated_at)";

/// One row of sync state
#[derive(Debug, Clone)]
pub struct SyncEntry {
    pub source: String,
    pub pg_id: String,
    pub text_hash: Option<String>,
    pub embedding_version: Option<String>,
    pub vector_id: Option<i64>,
    pub nsfw_score: Option<f32>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Aggregate counters for /status
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceSyncStats {
    pub tracked: i64,
    pub synced: i64,
    pub errors: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// State store handle
#[derive(Clone)]
pub struct SyncStateStore {
    pool: PgPool,
    schema: String,
}

/// Reject anything that cannot be a bare SQL identifier. Config values
/// are trusted operator input, but they still end up spliced into SQL.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if head_ok && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(());
    }
    Err(Error::Config(format!("invalid SQL identifier: {:?}", name)))
}

impl SyncStateStore {
    pub async fn connect(dsn: &str, schema: &str) -> Result<Self> {
        validate_identifier(schema)?;
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn from_pool(pool: PgPool, schema: &str) -> Result<Self> {
        validate_identifier(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self) -> String {
        format!("{}.sync_state", self.schema)
    }

    /// Create the schema and table if absent. Idempotent.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&self.pool)
            .await?;
        sqlx::query(&SYNC_TABLE_SQL.replace("{schema}", &self.schema))
            .execute(&self.pool)
            .await?;
        sqlx::query(&SYNC_INDEX_SQL.replace("{schema}", &self.schema))
            .execute(&self.pool)
            .await?;
        debug!("sync_state ready in schema {}", self.schema);
        Ok(())
    }

    /// Fetch existing entries for a set of ids within one source.
    pub async fn get_many(&self, source: &str, ids: &[String]) -> Result<Vec<SyncEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT source, pg_id, text_hash, embedding_version, vector_id, nsfw_score, \
             updated_at, last_error FROM {} WHERE source = $1 AND pg_id = ANY($2)",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Upsert a batch of entries in one transaction. `updated_at` is
    /// set server-side and `last_error` cleared.
    pub async fn upsert_many(&self, entries: &[SyncEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (source, pg_id, text_hash, embedding_version, vector_id, nsfw_score, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, now()) \
             ON CONFLICT (source, pg_id) DO UPDATE SET \
                 text_hash = EXCLUDED.text_hash, \
                 embedding_version = EXCLUDED.embedding_version, \
                 vector_id = EXCLUDED.vector_id, \
                 nsfw_score = EXCLUDED.nsfw_score, \
                 updated_at = now(), \
                 last_error = NULL",
            self.table()
        );

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(&sql)
                .bind(&entry.source)
                .bind(&entry.pg_id)
                .bind(&entry.text_hash)
                .bind(&entry.embedding_version)
                .bind(entry.vector_id)
                .bind(entry.nsfw_score)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record a per-row failure without touching hash or vector id, so
    /// the row is retried once its hash still differs next cycle.
    pub async fn mark_error(&self, source: &str, pg_id: &str, error: &str) -> Result<()> {
        let truncated: String = error.chars().take(512).collect();
        let sql = format!(
            "INSERT INTO {} (source, pg_id, last_error, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (source, pg_id) DO UPDATE SET \
                 last_error = EXCLUDED.last_error, updated_at = now()",
            self.table()
        );
        sqlx::query(&sql)
            .bind(source)
            .bind(pg_id)
            .bind(truncated)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Watermark for a source; epoch when nothing is tracked yet.
    pub async fn max_updated_at(&self, source: &str) -> Result<DateTime<Utc>> {
        let sql = format!(
            "SELECT max(updated_at) AS watermark FROM {} WHERE source = $1",
            self.table()
        );
        let row = sqlx::query(&sql)
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        let watermark: Option<DateTime<Utc>> = row.try_get("watermark")?;
        Ok(watermark.unwrap_or_else(epoch))
    }

    /// Ids whose sync never completed (no vector or a recorded error)
    /// touched after `since`; feeds retry sweeps.
    pub async fn missing_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT pg_id FROM {} \
             WHERE source = $1 AND updated_at > $2 \
               AND (vector_id IS NULL OR last_error IS NOT NULL) \
             ORDER BY updated_at ASC LIMIT $3",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("pg_id").map_err(Error::from))
            .collect()
    }

    /// Counters backing /status.
    pub async fn source_stats(&self, source: &str) -> Result<SourceSyncStats> {
        let sql = format!(
            "SELECT count(*) AS tracked, \
                    count(*) FILTER (WHERE vector_id IS NOT NULL AND last_error IS NULL) AS synced, \
                    count(*) FILTER (WHERE last_error IS NOT NULL) AS errors, \
                    max(updated_at) AS last_sync_at \
             FROM {} WHERE source = $1",
            self.table()
        );
        let row = sqlx::query(&sql)
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(SourceSyncStats {
            tracked: row.try_get("tracked")?,
            synced: row.try_get("synced")?,
            errors: row.try_get("errors")?,
            last_sync_at: row.try_get("last_sync_at")?,
        })
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<SyncEntry> {
    Ok(SyncEntry {
        source: row.try_get("source")?,
        pg_id: row.try_get("pg_id")?,
        text_hash: row.try_get("text_hash")?,
        embedding_version: row.try_get("embedding_version")?,
        vector_id: row.try_get("vector_id")?,
        nsfw_score: row.try_get("nsfw_score")?,
        updated_at: row.try_get("updated_at")?,
        last_error: row.try_get("last_error")?,
    })
}

/// 1970-01-01T00:00:00Z
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().expect("epoch is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("hermes").is_ok());
        assert!(validate_identifier("hermes_2").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2fast").is_err());
        assert!(validate_identifier("bad-name").is_err());
        assert!(validate_identifier("drop table;--").is_err());
    }

    #[test]
    fn test_epoch_is_unix_zero() {
        assert_eq!(epoch().timestamp(), 0);
    }
}
