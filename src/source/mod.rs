//! Source registry and upstream row access
//!
//! A source is one logical stream (table or view) feeding the index.
//! The reader pulls change batches by watermark for sync and re-reads
//! full rows for hydration; both sides must derive the same pg_id
//! string for a given upstream row. Composite-keyed sources rely on
//! upstream views that concatenate their key parts with `:`.

pub mod normalize;

use crate::config::SourceSpec;
use crate::error::{Error, Result};
use crate::state::validate_identifier;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use tracing::debug;

/// Ordered, name-indexed registry of sources. Immutable after startup.
pub struct SourceRegistry {
    specs: Vec<SourceSpec>,
    by_name: HashMap<String, usize>,
}

impl SourceRegistry {
    pub fn new(specs: Vec<SourceSpec>) -> Result<Self> {
        let mut by_name = HashMap::new();
        for (idx, spec) in specs.iter().enumerate() {
            for part in spec.table_or_view.split('.') {
                validate_identifier(part)?;
            }
            validate_identifier(&spec.id_field)?;
            validate_identifier(&spec.text_field)?;
            if let Some(field) = &spec.updated_at_field {
                validate_identifier(field)?;
            }
            for field in &spec.extra_fields {
                validate_identifier(field)?;
            }
            if by_name.insert(spec.name.clone(), idx).is_some() {
                return Err(Error::Config(format!("duplicate source: {}", spec.name)));
            }
        }
        Ok(Self { specs, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&SourceSpec> {
        self.by_name.get(name).map(|idx| &self.specs[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Position within a source's change stream.
#[derive(Debug, Clone)]
pub enum Watermark {
    /// Rows strictly after `(since, after_id)` in `(updated_at, id)`
    /// order; `after_id` disambiguates rows sharing a timestamp across
    /// batch boundaries
    UpdatedAt {
        since: DateTime<Utc>,
        after_id: Option<String>,
    },
    /// Full-scan keyset position: rows with id text greater than this
    Id(String),
}

impl Watermark {
    /// Advance past the given row for the next batch pull.
    pub fn advance(&mut self, row: &SourceRow) {
        match self {
            Watermark::UpdatedAt { since, after_id } => {
                if let Some(updated) = row.updated_at {
                    *since = updated;
                    *after_id = Some(row.pg_id.clone());
                }
            }
            Watermark::Id(after) => *after = row.pg_id.clone(),
        }
    }
}

/// One upstream row as read for sync.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub source: String,
    pub pg_id: String,
    /// Composed search text, before normalization
    pub text: String,
    pub extras: serde_json::Map<String, Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One hydrated row as served in search results.
#[derive(Debug, Clone)]
pub struct HydratedRow {
    pub pg_id: String,
    pub title: String,
    pub metadata: serde_json::Map<String, Value>,
}

/// Upstream database reader
#[derive(Clone)]
pub struct SourceReader {
    pool: PgPool,
}

impl SourceReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn select_columns(spec: &SourceSpec) -> String {
        let mut columns = vec![
            format!("t.{}::text AS pg_id", spec.id_field),
            format!("t.{}::text AS text", spec.text_field),
        ];
        if let Some(updated) = &spec.updated_at_field {
            columns.push(format!("t.{} AS updated_at", updated));
        }
        for field in &spec.extra_fields {
            columns.push(format!("to_jsonb(t.{field}) AS {field}", field = field));
        }
        columns.join(", ")
    }

    /// Pull the next change batch after the watermark, ordered by
    /// `(updated_at, id)` ascending (or id alone for full scans).
    pub async fn fetch_batch(
        &self,
        spec: &SourceSpec,
        watermark: &Watermark,
        batch_size: usize,
    ) -> Result<Vec<SourceRow>> {
        let columns = Self::select_columns(spec);
        let rows = match (watermark, &spec.updated_at_field) {
            (Watermark::UpdatedAt { since, after_id }, Some(updated)) => {
                let base = format!(
                    "SELECT {columns} FROM {table} t",
                    columns = columns,
                    table = spec.table_or_view,
                );
                let order = format!(
                    "ORDER BY t.{updated} ASC, t.{id}::text ASC LIMIT $2",
                    updated = updated,
                    id = spec.id_field,
                );
                match after_id {
                    Some(after) => {
                        let sql = format!(
                            "{base} WHERE t.{updated} > $1 \
                             OR (t.{updated} = $1 AND t.{id}::text > $3) {order}",
                            base = base,
                            updated = updated,
                            id = spec.id_field,
                            order = order,
                        );
                        sqlx::query(&sql)
                            .bind(since)
                            .bind(batch_size as i64)
                            .bind(after)
                            .fetch_all(&self.pool)
                            .await?
                    }
                    None => {
                        let sql = format!(
                            "{base} WHERE t.{updated} > $1 {order}",
                            base = base,
                            updated = updated,
                            order = order,
                        );
                        sqlx::query(&sql)
                            .bind(since)
                            .bind(batch_size as i64)
                            .fetch_all(&self.pool)
                            .await?
                    }
                }
            }
            (Watermark::Id(after), _) => {
                let sql = format!(
                    "SELECT {columns} FROM {table} t \
                     WHERE t.{id}::text > $1 \
                     ORDER BY t.{id}::text ASC LIMIT $2",
                    columns = columns,
                    table = spec.table_or_view,
                    id = spec.id_field,
                );
                sqlx::query(&sql)
                    .bind(after)
                    .bind(batch_size as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Watermark::UpdatedAt { .. }, None) => {
                return Err(Error::Config(format!(
                    "source '{}' has no updated_at_field; use an id watermark",
                    spec.name
                )));
            }
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.row_from_pg(spec, &row)?);
        }
        debug!("fetched {} rows from source {}", out.len(), spec.name);
        Ok(out)
    }

    fn row_from_pg(&self, spec: &SourceSpec, row: &sqlx::postgres::PgRow) -> Result<SourceRow> {
        let pg_id: String = row.try_get("pg_id")?;
        let text: Option<String> = row.try_get("text")?;
        let updated_at = if spec.updated_at_field.is_some() {
            row.try_get::<Option<DateTime<Utc>>, _>("updated_at")?
        } else {
            None
        };
        let mut extras = serde_json::Map::new();
        for field in &spec.extra_fields {
            let value: Option<Value> = row.try_get(field.as_str())?;
            extras.insert(field.clone(), value.unwrap_or(Value::Null));
        }
        let text = compose_search_text(spec, text.unwrap_or_default(), &extras);
        Ok(SourceRow {
            source: spec.name.clone(),
            pg_id,
            text,
            extras,
            updated_at,
        })
    }

    /// Re-read full rows for ids returned by the vector store. The map
    /// is keyed by the same pg_id string the sync side produced.
    pub async fn fetch_by_ids(
        &self,
        spec: &SourceSpec,
        ids: &[String],
        lite: bool,
    ) -> Result<HashMap<String, HydratedRow>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let columns = if lite {
            format!(
                "t.{}::text AS pg_id, t.{}::text AS text",
                spec.id_field, spec.text_field
            )
        } else {
            Self::select_columns(spec)
        };
        let sql = format!(
            "SELECT {columns} FROM {table} t WHERE t.{id}::text = ANY($1)",
            columns = columns,
            table = spec.table_or_view,
            id = spec.id_field,
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let pg_id: String = row.try_get("pg_id")?;
            let title: Option<String> = row.try_get("text")?;
            let mut metadata = serde_json::Map::new();
            if !lite {
                for field in &spec.extra_fields {
                    let value: Option<Value> = row.try_get(field.as_str())?;
                    metadata.insert(field.clone(), value.unwrap_or(Value::Null));
                }
            }
            out.insert(
                pg_id.clone(),
                HydratedRow {
                    pg_id,
                    title: title.unwrap_or_default(),
                    metadata,
                },
            );
        }
        Ok(out)
    }

    /// ILIKE fallback for /search_keyword.
    pub async fn search_by_keyword(
        &self,
        spec: &SourceSpec,
        query: &str,
        limit: usize,
    ) -> Result<Vec<HydratedRow>> {
        let pattern = format!("%{}%", escape_like(query));
        let sql = format!(
            "SELECT t.{id}::text AS pg_id, t.{text}::text AS text \
             FROM {table} t WHERE t.{text} ILIKE $1 LIMIT $2",
            id = spec.id_field,
            text = spec.text_field,
            table = spec.table_or_view,
        );
        let rows = sqlx::query(&sql)
            .bind(pattern)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let pg_id: String = row.try_get("pg_id")?;
                let title: Option<String> = row.try_get("text")?;
                Ok(HydratedRow {
                    pg_id,
                    title: title.unwrap_or_default(),
                    metadata: serde_json::Map::new(),
                })
            })
            .collect()
    }

    /// Upstream row count, for /status.
    pub async fn count(&self, spec: &SourceSpec) -> Result<i64> {
        let sql = format!("SELECT count(*) AS total FROM {} t", spec.table_or_view);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("total")?)
    }
}

/// Fold the configured extra fields into the embedded search text.
fn compose_search_text(
    spec: &SourceSpec,
    text: String,
    extras: &serde_json::Map<String, Value>,
) -> String {
    if spec.search_text_fields.is_empty() {
        return text;
    }
    let mut parts = vec![text];
    for field in &spec.search_text_fields {
        match extras.get(field) {
            Some(Value::String(s)) if !s.is_empty() => parts.push(s.clone()),
            Some(Value::Array(items)) => {
                let joined = items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                if !joined.is_empty() {
                    parts.push(joined);
                }
            }
            Some(Value::Number(n)) => parts.push(n.to_string()),
            _ => {}
        }
    }
    parts.join(" ")
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SourceSpec {
        SourceSpec {
            name: "content".to_string(),
            table_or_view: "hermes.content_search".to_string(),
            id_field: "content_uid".to_string(),
            text_field: "title".to_string(),
            updated_at_field: Some("updated_at".to_string()),
            extra_fields: vec!["genre".to_string(), "aka".to_string(), "size".to_string()],
            search_text_fields: vec!["genre".to_string(), "aka".to_string()],
            content_type: Some("movie".to_string()),
            tmdb_enrich: true,
            keyword_search: false,
            batch_size: 128,
        }
    }

    #[test]
    fn test_registry_indexes_by_name_in_order() {
        let mut other = spec();
        other.name = "bitmagnet_torrents".to_string();
        let registry = SourceRegistry::new(vec![spec(), other]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("content").unwrap().text_field, "title");
        assert!(registry.get("missing").is_none());
        let names: Vec<_> = registry.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["content", "bitmagnet_torrents"]);
    }

    #[test]
    fn test_registry_rejects_bad_identifiers() {
        let mut bad = spec();
        bad.id_field = "id; DROP TABLE".to_string();
        assert!(SourceRegistry::new(vec![bad]).is_err());
    }

    #[test]
    fn test_compose_search_text_folds_selected_extras() {
        let mut extras = serde_json::Map::new();
        extras.insert("genre".to_string(), Value::String("Thriller".to_string()));
        extras.insert(
            "aka".to_string(),
            Value::Array(vec![
                Value::String("Alias One".to_string()),
                Value::String("Alias Two".to_string()),
            ]),
        );
        extras.insert("size".to_string(), Value::Number(123.into()));

        let text = compose_search_text(&spec(), "The Title".to_string(), &extras);
        assert_eq!(text, "The Title Thriller Alias One Alias Two");
    }

    #[test]
    fn test_compose_skips_missing_and_empty_extras() {
        let extras = serde_json::Map::new();
        let text = compose_search_text(&spec(), "Bare".to_string(), &extras);
        assert_eq!(text, "Bare");
    }

    #[test]
    fn test_escape_like_wildcards() {
        assert_eq!(escape_like("100%_done\\x"), "100\\%\\_done\\\\x");
    }
}
