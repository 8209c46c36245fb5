//! Cross-language semantic search orchestrator
//!
//! One request flows clean -> expand -> embed -> primary vector query
//! -> optional cross-language secondary query -> merge -> paginate ->
//! hydrate. Expansion and the secondary hop degrade silently; embedding
//! and vector-store failures surface to the HTTP layer. Every stage is
//! timed for the `debug=true` response.

use crate::config::SearchConfig;
use crate::embed::{EmbedRole, Embedder};
use crate::error::{Error, Result};
use crate::expand::{extract_genres, Expansion, QueryExpander};
use crate::source::normalize::is_non_ascii;
use crate::source::{SourceReader, SourceRegistry};
use crate::store::{MetadataFilter, SearchHit, VectorStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Parsed /search parameters.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub q: String,
    pub topk: usize,
    pub fetch_k: usize,
    pub exclude_nsfw: bool,
    pub tmdb_only: bool,
    pub size_min_bytes: Option<i64>,
    pub tmdb_expand: bool,
    pub lite: bool,
    pub debug: bool,
    pub cursor: usize,
}

/// One hydrated search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub source: String,
    pub pg_id: String,
    pub title: String,
    pub score: f32,
    pub nsfw: bool,
    pub nsfw_score: f32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Stage timings in milliseconds, present when `debug=true`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchTimings {
    pub tmdb_expand: f64,
    pub embed: f64,
    pub qdrant: f64,
    pub english_search: f64,
    pub pg_loop: f64,
    pub total: f64,
    pub pg_sources: Vec<PgSourceTiming>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PgSourceTiming {
    pub source: String,
    pub pg_fetch_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchDebug {
    #[serde(flatten)]
    pub timings: SearchTimings,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub count: usize,
    pub results: Vec<SearchResultItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<usize>,
    #[serde(rename = "_debug", skip_serializing_if = "Option::is_none")]
    pub debug: Option<SearchDebug>,
}

/// Merge primary and secondary hits: dedupe by `(source, pg_id)`
/// keeping the max score, order by score descending with ascending-id
/// tie-break, truncate to the fetch window. Deterministic for the same
/// inputs regardless of which query finished first.
pub fn merge_hits(
    primary: Vec<SearchHit>,
    secondary: Vec<SearchHit>,
    fetch_k: usize,
) -> Vec<SearchHit> {
    let mut best: HashMap<(String, String), SearchHit> = HashMap::new();
    for hit in primary.into_iter().chain(secondary) {
        let key = (hit.payload.source.clone(), hit.payload.pg_id.clone());
        match best.get_mut(&key) {
            Some(existing) if existing.score >= hit.score => {}
            Some(existing) => *existing = hit,
            None => {
                best.insert(key, hit);
            }
        }
    }
    let mut merged: Vec<SearchHit> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    merged.truncate(fetch_k);
    merged
}

/// Offset-style cursor over the merged window.
pub fn paginate(merged: &[SearchHit], cursor: usize, topk: usize) -> (&[SearchHit], Option<usize>) {
    if cursor >= merged.len() {
        return (&[], None);
    }
    let end = (cursor + topk).min(merged.len());
    let next = (end < merged.len()).then_some(end);
    (&merged[cursor..end], next)
}

pub struct SearchOrchestrator {
    registry: Arc<SourceRegistry>,
    reader: SourceReader,
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    expander: Option<QueryExpander>,
    nsfw_threshold: f32,
    config: SearchConfig,
}

impl SearchOrchestrator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        reader: SourceReader,
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        expander: Option<QueryExpander>,
        nsfw_threshold: f32,
        config: SearchConfig,
    ) -> Self {
        Self {
            registry,
            reader,
            store,
            embedder,
            expander,
            nsfw_threshold,
            config,
        }
    }

    /// Run the full hybrid search path.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let deadline = started + Duration::from_secs_f64(self.config.gpu_timeout_seconds);
        let mut timings = SearchTimings::default();
        let mut warnings = Vec::new();

        let cleaned_q = request.q.trim().to_string();
        if cleaned_q.is_empty() {
            return Err(Error::EmptyQuery);
        }

        // Expansion degrades silently under its own budget.
        let expansion = if request.tmdb_expand {
            let stage = Instant::now();
            let expansion = match &self.expander {
                Some(expander) => expander.expand(&cleaned_q).await,
                None => Expansion {
                    expanded_query: cleaned_q.clone(),
                    english_expansion: String::new(),
                },
            };
            timings.tmdb_expand = ms_since(stage);
            expansion
        } else {
            Expansion {
                expanded_query: cleaned_q.clone(),
                english_expansion: String::new(),
            }
        };

        // Embed the expanded query.
        let stage = Instant::now();
        let primary_vector = self
            .embed_one(&expansion.expanded_query, deadline)
            .await?;
        timings.embed = ms_since(stage);

        // Primary filtered query.
        let genres = extract_genres(&cleaned_q);
        let primary_filter = self.build_filter(request, genres);
        let stage = Instant::now();
        let primary_hits = self
            .store
            .query(
                &primary_vector,
                request.fetch_k,
                (!primary_filter.is_empty()).then_some(&primary_filter),
            )
            .await?;
        timings.qdrant = ms_since(stage);

        // Cross-language hop: non-ASCII query with an English expansion
        // gets a second pass under a minimal filter, because raw
        // torrent rows carry no enrichment metadata to filter on.
        let secondary_hits = if is_non_ascii(&cleaned_q) && !expansion.english_expansion.is_empty()
        {
            let stage = Instant::now();
            let hits = self
                .secondary_query(&expansion.english_expansion, request, deadline)
                .await
                .unwrap_or_else(|e| {
                    debug!("secondary query degraded: {}", e);
                    warnings.push(format!("english_search: {}", e.kind()));
                    Vec::new()
                });
            timings.english_search = ms_since(stage);
            hits
        } else {
            Vec::new()
        };

        let merged = merge_hits(primary_hits, secondary_hits, request.fetch_k);
        let (window, next_cursor) = paginate(&merged, request.cursor, request.topk);

        // Hydration, grouped per source, preserving score order.
        let stage = Instant::now();
        let results = self
            .hydrate(window, request.lite, &mut timings, &mut warnings)
            .await;
        timings.pg_loop = ms_since(stage);
        timings.total = ms_since(started);

        Ok(SearchResponse {
            count: results.len(),
            results,
            next_cursor,
            debug: request.debug.then_some(SearchDebug { timings, warnings }),
        })
    }

    async fn embed_one(&self, text: &str, deadline: Instant) -> Result<Vec<f32>> {
        let budget = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| Error::Cancelled("search deadline exhausted".to_string()))?;
        let texts = vec![text.to_string()];
        let mut embeddings = tokio::time::timeout(budget, self.embedder.embed(&texts, EmbedRole::Query))
            .await
            .map_err(|_| Error::Cancelled("embedding exceeded request deadline".to_string()))??;
        embeddings
            .pop()
            .ok_or_else(|| Error::EmbedUnavailable("no embedding returned".to_string()))
    }

    fn build_filter(&self, request: &SearchRequest, genres: Vec<String>) -> MetadataFilter {
        MetadataFilter {
            source: None,
            has_tmdb: request.tmdb_only.then_some(true),
            nsfw_score_below: request.exclude_nsfw.then_some(self.nsfw_threshold),
            size_min_bytes: request.size_min_bytes,
            genres,
            content_type: None,
        }
    }

    async fn secondary_query(
        &self,
        english: &str,
        request: &SearchRequest,
        deadline: Instant,
    ) -> Result<Vec<SearchHit>> {
        let vector = self.embed_one(english, deadline).await?;
        let filter = MetadataFilter {
            size_min_bytes: request.size_min_bytes,
            ..Default::default()
        };
        self.store
            .query(
                &vector,
                request.fetch_k,
                (!filter.is_empty()).then_some(&filter),
            )
            .await
    }

    /// Group the window's ids by source, fetch their rows, and emit
    /// items in the window's score order. A source missing from the
    /// registry or failing to hydrate drops its hits with a warning;
    /// individually missing rows (deleted upstream) are skipped.
    async fn hydrate(
        &self,
        window: &[SearchHit],
        lite: bool,
        timings: &mut SearchTimings,
        warnings: &mut Vec<String>,
    ) -> Vec<SearchResultItem> {
        let mut ids_by_source: HashMap<&str, Vec<String>> = HashMap::new();
        for hit in window {
            ids_by_source
                .entry(hit.payload.source.as_str())
                .or_default()
                .push(hit.payload.pg_id.clone());
        }

        let mut rows_by_source: HashMap<String, HashMap<String, crate::source::HydratedRow>> =
            HashMap::new();
        for (source, ids) in ids_by_source {
            let Some(spec) = self.registry.get(source) else {
                warn!("skipping hits from unknown source {}", source);
                warnings.push(format!("unknown source: {}", source));
                continue;
            };
            let stage = Instant::now();
            match self.reader.fetch_by_ids(spec, &ids, lite).await {
                Ok(rows) => {
                    rows_by_source.insert(source.to_string(), rows);
                }
                Err(e) => {
                    warn!("hydration failed for source {}: {}", source, e);
                    warnings.push(format!("hydration failed for {}: {}", source, e.kind()));
                }
            }
            timings.pg_sources.push(PgSourceTiming {
                source: source.to_string(),
                pg_fetch_ms: ms_since(stage),
            });
        }

        window
            .iter()
            .filter_map(|hit| {
                let rows = rows_by_source.get(hit.payload.source.as_str())?;
                let row = rows.get(hit.payload.pg_id.as_str())?;
                let nsfw_score = hit.payload.nsfw_score.unwrap_or(0.0);
                Some(SearchResultItem {
                    source: hit.payload.source.clone(),
                    pg_id: hit.payload.pg_id.clone(),
                    title: row.title.clone(),
                    score: hit.score,
                    nsfw: nsfw_score >= self.nsfw_threshold,
                    nsfw_score,
                    metadata: row.metadata.clone(),
                })
            })
            .collect()
    }
}

fn ms_since(instant: Instant) -> f64 {
    instant.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorPayload;

    fn hit(source: &str, pg_id: &str, id: i64, score: f32) -> SearchHit {
        SearchHit {
            id,
            score,
            payload: VectorPayload::new(
                source.to_string(),
                pg_id.to_string(),
                "hash".to_string(),
                "v".to_string(),
            ),
        }
    }

    #[test]
    fn test_merge_dedupes_keeping_max_score() {
        let primary = vec![hit("a", "1", 10, 0.9), hit("a", "2", 11, 0.5)];
        let secondary = vec![hit("a", "2", 11, 0.8), hit("b", "1", 12, 0.7)];

        let merged = merge_hits(primary, secondary, 10);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].score, 0.9);
        assert_eq!(merged[1].score, 0.8);
        assert_eq!(merged[1].payload.pg_id, "2");
        assert_eq!(merged[2].score, 0.7);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let primary = vec![hit("a", "1", 10, 0.9), hit("a", "2", 11, 0.5)];
        let secondary = vec![hit("a", "2", 11, 0.8), hit("b", "1", 12, 0.7)];

        let forward = merge_hits(primary.clone(), secondary.clone(), 10);
        let reversed = merge_hits(secondary, primary, 10);
        let key = |hits: &[SearchHit]| {
            hits.iter()
                .map(|h| (h.id, h.payload.pg_id.clone(), h.score.to_bits()))
                .collect::<Vec<_>>()
        };
        assert_eq!(key(&forward), key(&reversed));
    }

    #[test]
    fn test_merge_ties_break_by_ascending_id() {
        let merged = merge_hits(
            vec![hit("a", "2", 20, 0.8), hit("a", "1", 7, 0.8)],
            Vec::new(),
            10,
        );
        assert_eq!(merged[0].id, 7);
        assert_eq!(merged[1].id, 20);
    }

    #[test]
    fn test_merge_truncates_to_fetch_k() {
        let primary: Vec<SearchHit> = (0..10)
            .map(|i| hit("a", &i.to_string(), i, 1.0 - i as f32 * 0.01))
            .collect();
        let merged = merge_hits(primary, Vec::new(), 4);
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn test_paginate_window_and_next_cursor() {
        let merged: Vec<SearchHit> = (0..10)
            .map(|i| hit("a", &i.to_string(), i, 1.0 - i as f32 * 0.01))
            .collect();

        let (page, next) = paginate(&merged, 0, 4);
        assert_eq!(page.len(), 4);
        assert_eq!(next, Some(4));

        let (page, next) = paginate(&merged, 8, 4);
        assert_eq!(page.len(), 2);
        assert_eq!(next, None);

        let (page, next) = paginate(&merged, 50, 4);
        assert!(page.is_empty());
        assert_eq!(next, None);
    }

    #[test]
    fn test_cross_language_hit_outranks_weaker_secondary() {
        // A strong primary hit and a weaker secondary hit for the same
        // query end up ordered by score after the merge.
        let primary = vec![hit("bitmagnet_torrents", "jojo-hash", 1, 0.86)];
        let secondary = vec![hit("bitmagnet_torrents", "other-hash", 2, 0.5)];
        let merged = merge_hits(primary, secondary, 10);
        assert_eq!(merged[0].payload.pg_id, "jojo-hash");
        assert!(merged[0].score >= 0.8);
        assert_eq!(merged[1].payload.pg_id, "other-hash");
    }
}
