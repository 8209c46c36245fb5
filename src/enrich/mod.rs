//! Enrichment worker
//!
//! Fills the `tmdb_enrichment` table for content rows that have no
//! enrichment yet (or only an empty shell). The TMDB client paces its
//! own outbound requests, so the worker just loops candidates. The
//! table is owned here and read-only to everything else.

pub mod tmdb;

pub use tmdb::{TmdbClient, TmdbValues};

use crate::config::TmdbConfig;
use crate::error::{Error, Result};
use crate::state::validate_identifier;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const ENRICHMENT_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS {schema}.tmdb_enrichment (
    content_type TEXT NOT NULL,
    content_source TEXT NOT NULL,
    content_id TEXT NOT NULL,
    title TEXT,
    aka TEXT,
    keywords TEXT,
    plot TEXT,
    genre TEXT,
    directors TEXT,
    actors TEXT,
    release_year INTEGER,
    poster_path TEXT,
    status TEXT NOT NULL DEFAULT 'ok',
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (content_type, content_source, content_id)
);
"#;

/// One content row needing enrichment.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub content_type: String,
    pub content_source: String,
    pub content_id: String,
}

/// Counters for one enrichment pass.
#[derive(Debug, Default, Clone)]
pub struct EnrichStats {
    pub selected: usize,
    pub enriched: usize,
    pub failed: usize,
}

pub struct EnrichmentWorker {
    pool: PgPool,
    schema: String,
    client: TmdbClient,
    config: TmdbConfig,
}

impl EnrichmentWorker {
    pub fn new(pool: PgPool, schema: &str, config: TmdbConfig, api_key: String) -> Result<Self> {
        validate_identifier(schema)?;
        let client = TmdbClient::new(&config, api_key)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
            client,
            config,
        })
    }

    fn table(&self) -> String {
        format!("{}.tmdb_enrichment", self.schema)
    }

    /// Create the enrichment table if absent. Idempotent.
    pub async fn ensure_table(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&self.pool)
            .await?;
        sqlx::query(&ENRICHMENT_TABLE_SQL.replace("{schema}", &self.schema))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Content rows with no enrichment row, or an enrichment row that
    /// never got titles/keywords, bounded to `limit`.
    pub async fn select_candidates(&self, limit: usize) -> Result<Vec<Candidate>> {
        let sql = format!(
            "SELECT c.type AS content_type, c.source AS content_source, c.id::text AS content_id \
             FROM public.content c \
             LEFT JOIN {table} te \
               ON te.content_type = c.type \
              AND te.content_source = c.source \
              AND te.content_id = c.id::text \
             WHERE c.source = 'tmdb' \
               AND (te.content_id IS NULL OR (te.aka IS NULL AND te.keywords IS NULL)) \
             ORDER BY c.id LIMIT $1",
            table = self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Candidate {
                    content_type: row.try_get("content_type")?,
                    content_source: row.try_get("content_source")?,
                    content_id: row.try_get("content_id")?,
                })
            })
            .collect()
    }

    /// Write one enrichment result (or failure marker) transactionally.
    async fn upsert_row(
        &self,
        candidate: &Candidate,
        values: &TmdbValues,
        status: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} \
                 (content_type, content_source, content_id, title, aka, keywords, plot, genre, \
                  directors, actors, release_year, poster_path, status, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now()) \
             ON CONFLICT (content_type, content_source, content_id) DO UPDATE SET \
                 title = EXCLUDED.title, \
                 aka = EXCLUDED.aka, \
                 keywords = EXCLUDED.keywords, \
                 plot = EXCLUDED.plot, \
                 genre = EXCLUDED.genre, \
                 directors = EXCLUDED.directors, \
                 actors = EXCLUDED.actors, \
                 release_year = EXCLUDED.release_year, \
                 poster_path = EXCLUDED.poster_path, \
                 status = EXCLUDED.status, \
                 updated_at = now()",
            self.table()
        );
        sqlx::query(&sql)
            .bind(&candidate.content_type)
            .bind(&candidate.content_source)
            .bind(&candidate.content_id)
            .bind(&values.title)
            .bind(&values.aka)
            .bind(&values.keywords)
            .bind(&values.plot)
            .bind(&values.genre)
            .bind(&values.directors)
            .bind(&values.actors)
            .bind(values.release_year)
            .bind(&values.poster_path)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// One enrichment pass over up to `tmdb.limit` candidates.
    pub async fn run_once(&self) -> Result<EnrichStats> {
        let candidates = self.select_candidates(self.config.limit).await?;
        let mut stats = EnrichStats {
            selected: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(stats);
        }
        info!("enriching {} candidates", candidates.len());

        for candidate in &candidates {
            match self
                .client
                .fetch(&candidate.content_type, &candidate.content_id)
                .await
            {
                Ok(values) => {
                    self.upsert_row(candidate, &values, "ok").await?;
                    stats.enriched += 1;
                }
                Err(e) => {
                    warn!(
                        "enrichment failed for {}:{}:{}: {}",
                        candidate.content_type, candidate.content_source, candidate.content_id, e
                    );
                    let marker = TmdbValues::default();
                    let status = format!("error: {}", truncate(&e.to_string(), 256));
                    self.upsert_row(candidate, &marker, &status).await?;
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Loop mode: passes separated by `sleep_seconds`. With
    /// `exit_when_drained` the loop ends once no candidates remain;
    /// otherwise it idles and re-checks, exiting only on shutdown.
    pub async fn run_loop(
        &self,
        mut stop: watch::Receiver<bool>,
        exit_when_drained: bool,
    ) -> Result<()> {
        loop {
            if *stop.borrow() {
                break;
            }
            let stats = self.run_once().await?;
            if stats.selected == 0 && exit_when_drained {
                info!("no candidates left to enrich");
                break;
            }
            tokio::select! {
                _ = stop.changed() => {}
                _ = tokio::time::sleep(Duration::from_secs_f64(self.config.sleep_seconds)) => {}
            }
        }
        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Resolve the API key or explain what is missing.
pub fn require_api_key(config: &crate::config::Config) -> Result<String> {
    if !config.tmdb.enabled {
        return Err(Error::Config(
            "tmdb.enabled must be true for enrichment".to_string(),
        ));
    }
    config.tmdb_api_key()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("奇妙冒险", 2), "奇妙");
    }
}
