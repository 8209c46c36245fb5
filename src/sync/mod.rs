//! Incremental sync pipeline
//!
//! Per source and per cycle: pull change batches by watermark, diff
//! against the state table by content hash, embed what is novel or
//! changed, upsert vectors with their payloads, and commit state in
//! non-decreasing `(updated_at, id)` order. Replaying an unchanged
//! batch costs zero embedding calls.
//!
//! Row lifecycle: absent -> pending -> embedded -> indexed -> committed,
//! with failures landing in `sync_state.last_error` for retry on the
//! next cycle.
//!
//! TODO: upstream deletions are not propagated yet; a scheduled
//! compaction pass comparing state ids against the source tables will
//! own that.

use crate::config::{Config, SourceSpec};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::source::normalize::{normalize_search_text, text_hash};
use crate::source::{SourceReader, SourceRow, Watermark};
use crate::state::{SyncEntry, SyncStateStore};
use crate::store::{UpsertPoint, VectorPayload, VectorStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Counters for one sync cycle, following the per-row state machine.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct CycleStats {
    pub scanned: usize,
    pub unchanged: usize,
    pub embedded: usize,
    pub indexed: usize,
    pub committed: usize,
    pub failed: usize,
}

impl CycleStats {
    fn absorb(&mut self, other: &CycleStats) {
        self.scanned += other.scanned;
        self.unchanged += other.unchanged;
        self.embedded += other.embedded;
        self.indexed += other.indexed;
        self.committed += other.committed;
        self.failed += other.failed;
    }
}

/// A row with its normalization products.
#[derive(Debug, Clone)]
pub struct HashedRow {
    pub row: SourceRow,
    pub normalized: String,
    pub hash: String,
}

/// Normalize and hash a batch of rows.
pub fn hash_rows(rows: Vec<SourceRow>) -> Vec<HashedRow> {
    rows.into_iter()
        .map(|row| {
            let normalized = normalize_search_text(&row.text);
            let hash = text_hash(&normalized);
            HashedRow {
                row,
                normalized,
                hash,
            }
        })
        .collect()
}

/// Split a hashed batch into up-to-date rows and rows needing work.
///
/// A row is up to date iff its current hash equals the stored hash and
/// the stored embedding version matches the active one.
pub fn partition_rows<'a>(
    rows: &'a [HashedRow],
    existing: &HashMap<String, SyncEntry>,
    active_version: &str,
) -> (Vec<&'a HashedRow>, Vec<&'a HashedRow>) {
    let mut unchanged = Vec::new();
    let mut pending = Vec::new();
    for hashed in rows {
        let entry = existing.get(&hashed.row.pg_id);
        let up_to_date = entry.map_or(false, |e| {
            e.vector_id.is_some()
                && e.text_hash.as_deref() == Some(hashed.hash.as_str())
                && e.embedding_version.as_deref() == Some(active_version)
        });
        if up_to_date {
            unchanged.push(hashed);
        } else {
            pending.push(hashed);
        }
    }
    (unchanged, pending)
}

/// Build the vector payload for a row from its source spec and extras.
pub fn build_payload(
    spec: &SourceSpec,
    hashed: &HashedRow,
    version: &str,
    nsfw_score: f32,
) -> VectorPayload {
    let extras = &hashed.row.extras;
    let mut payload = VectorPayload::new(
        hashed.row.source.clone(),
        hashed.row.pg_id.clone(),
        hashed.hash.clone(),
        version.to_string(),
    );
    payload.nsfw_score = Some(nsfw_score);
    payload.content_type = spec.content_type.clone();
    payload.size = extras.get("size").and_then(Value::as_i64);
    payload.languages = string_list(extras.get("languages"));
    payload.subtitles = string_list(extras.get("subtitles"));
    payload.genres = string_list(extras.get("genres").or_else(|| extras.get("genre")));

    if spec.tmdb_enrich {
        let tmdb_id = extras.get("tmdb_id").and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        payload.has_tmdb = Some(tmdb_id.is_some());
        payload.tmdb_id = tmdb_id;
    }
    payload
}

/// Accept `["a","b"]` or `"a, b"` shapes from upstream extras.
fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::Array(items) => {
            let list: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            (!list.is_empty()).then_some(list)
        }
        Value::String(s) => {
            let list: Vec<String> = s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            (!list.is_empty()).then_some(list)
        }
        _ => None,
    }
}

/// Embed the pending rows and upsert their vectors, reusing stored
/// vector ids where available. Returns the state entries to commit.
/// The vector upsert is atomic per batch: on failure nothing is
/// returned and the caller leaves state untouched, making retry safe.
pub async fn index_rows(
    store: &VectorStore,
    embedder: &dyn Embedder,
    spec: &SourceSpec,
    pending: &[&HashedRow],
    existing: &HashMap<String, SyncEntry>,
) -> Result<Vec<SyncEntry>> {
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = pending.iter().map(|h| h.normalized.clone()).collect();
    let (embeddings, scores) = embedder.infer(&texts).await?;
    if embeddings.len() != pending.len() {
        return Err(Error::EmbedUnavailable(format!(
            "expected {} embeddings, got {}",
            pending.len(),
            embeddings.len()
        )));
    }

    let version = embedder.version();
    let mut points = Vec::with_capacity(pending.len());
    for (idx, hashed) in pending.iter().enumerate() {
        let nsfw_score = scores.get(idx).copied().unwrap_or(0.0);
        points.push(UpsertPoint {
            id: existing
                .get(&hashed.row.pg_id)
                .and_then(|e| e.vector_id),
            vector: embeddings[idx].clone(),
            payload: build_payload(spec, hashed, version, nsfw_score),
        });
    }

    let ids = store.upsert(points).await?;

    let entries = pending
        .iter()
        .zip(ids)
        .enumerate()
        .map(|(idx, (hashed, vector_id))| SyncEntry {
            source: hashed.row.source.clone(),
            pg_id: hashed.row.pg_id.clone(),
            text_hash: Some(hashed.hash.clone()),
            embedding_version: Some(version.to_string()),
            vector_id: Some(vector_id),
            nsfw_score: Some(scores.get(idx).copied().unwrap_or(0.0)),
            updated_at: chrono::Utc::now(),
            last_error: None,
        })
        .collect();
    Ok(entries)
}

/// The sync engine shared by all source workers.
pub struct SyncPipeline {
    reader: SourceReader,
    state: SyncStateStore,
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl SyncPipeline {
    pub fn new(
        reader: SourceReader,
        state: SyncStateStore,
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            reader,
            state,
            store,
            embedder,
        }
    }

    /// Run one full cycle for a source: batches until the reader comes
    /// up short. `stop` is honored between batches so the in-flight
    /// batch always completes.
    pub async fn sync_source(
        &self,
        spec: &SourceSpec,
        stop: &watch::Receiver<bool>,
    ) -> Result<CycleStats> {
        info!("sync start for source={}", spec.name);
        let mut watermark = match &spec.updated_at_field {
            Some(_) => Watermark::UpdatedAt {
                since: self.state.max_updated_at(&spec.name).await?,
                after_id: None,
            },
            None => Watermark::Id(String::new()),
        };

        let mut totals = CycleStats::default();
        loop {
            if *stop.borrow() {
                info!("sync interrupted for source={}", spec.name);
                break;
            }

            let rows = self
                .reader
                .fetch_batch(spec, &watermark, spec.batch_size)
                .await?;
            let short = rows.len() < spec.batch_size;
            if rows.is_empty() {
                break;
            }
            if let Some(last) = rows.last() {
                watermark.advance(last);
            }

            let stats = self.sync_batch(spec, rows).await?;
            totals.absorb(&stats);

            if short {
                break;
            }
        }

        info!(
            "sync done for source={}: scanned={} unchanged={} committed={} failed={}",
            spec.name, totals.scanned, totals.unchanged, totals.committed, totals.failed
        );
        Ok(totals)
    }

    /// Diff, embed, index and commit one batch of rows.
    pub async fn sync_batch(&self, spec: &SourceSpec, rows: Vec<SourceRow>) -> Result<CycleStats> {
        let mut stats = CycleStats {
            scanned: rows.len(),
            ..Default::default()
        };

        let hashed = hash_rows(rows);
        let ids: Vec<String> = hashed.iter().map(|h| h.row.pg_id.clone()).collect();
        let existing: HashMap<String, SyncEntry> = self
            .state
            .get_many(&spec.name, &ids)
            .await?
            .into_iter()
            .map(|e| (e.pg_id.clone(), e))
            .collect();

        let (unchanged, pending) =
            partition_rows(&hashed, &existing, self.embedder.version());
        stats.unchanged = unchanged.len();
        if pending.is_empty() {
            return Ok(stats);
        }

        let entries =
            match index_rows(&self.store, self.embedder.as_ref(), spec, &pending, &existing)
                .await
            {
                Ok(entries) => entries,
                Err(e @ Error::EmbedUnavailable(_)) | Err(e @ Error::EmbedBusy(_)) => {
                    // Embedding outage: record the failure per row and
                    // surface it; state keeps its old hashes so the
                    // next cycle retries.
                    stats.failed = pending.len();
                    for hashed in &pending {
                        if let Err(mark_err) = self
                            .state
                            .mark_error(&spec.name, &hashed.row.pg_id, &e.to_string())
                            .await
                        {
                            warn!(
                                "failed to record sync error for {}:{}: {}",
                                spec.name, hashed.row.pg_id, mark_err
                            );
                        }
                    }
                    return Err(e);
                }
                // Vector-store failures leave state fully untouched so a
                // straight retry is safe.
                Err(e) => return Err(e),
            };

        stats.embedded = entries.len();
        stats.indexed = entries.len();
        self.state.upsert_many(&entries).await?;
        stats.committed = entries.len();
        Ok(stats)
    }
}

/// Long-lived worker: one per source, cycling until shutdown.
pub async fn run_source_worker(
    pipeline: Arc<SyncPipeline>,
    spec: SourceSpec,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        match pipeline.sync_source(&spec, &stop).await {
            Ok(stats) => {
                if stats.failed > 0 {
                    warn!(
                        "source {} cycle completed with {} failed rows",
                        spec.name, stats.failed
                    );
                }
            }
            Err(e) => warn!("sync cycle failed for source {}: {}", spec.name, e),
        }

        tokio::select! {
            _ = stop.changed() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("sync worker for source {} stopped", spec.name);
}

/// Spawn one worker per source plus the shutdown broadcaster.
pub fn spawn_workers(
    pipeline: Arc<SyncPipeline>,
    config: &Config,
    stop: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let interval = Duration::from_secs(config.server.sync_interval_seconds);
    config
        .sources
        .iter()
        .map(|spec| {
            tokio::spawn(run_source_worker(
                pipeline.clone(),
                spec.clone(),
                interval,
                stop.clone(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::testing::ScriptedEmbedder;
    use crate::store::LocalHnswStore;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn spec() -> SourceSpec {
        SourceSpec {
            name: "bitmagnet_torrents".to_string(),
            table_or_view: "public.torrents".to_string(),
            id_field: "info_hash".to_string(),
            text_field: "name".to_string(),
            updated_at_field: Some("updated_at".to_string()),
            extra_fields: vec!["size".to_string(), "tmdb_id".to_string()],
            search_text_fields: vec![],
            content_type: Some("torrent".to_string()),
            tmdb_enrich: true,
            keyword_search: true,
            batch_size: 128,
        }
    }

    fn row(pg_id: &str, text: &str) -> SourceRow {
        SourceRow {
            source: "bitmagnet_torrents".to_string(),
            pg_id: pg_id.to_string(),
            text: text.to_string(),
            extras: serde_json::Map::new(),
            updated_at: Some(Utc::now()),
        }
    }

    fn committed_entry(hashed: &HashedRow, version: &str, vector_id: i64) -> SyncEntry {
        SyncEntry {
            source: hashed.row.source.clone(),
            pg_id: hashed.row.pg_id.clone(),
            text_hash: Some(hashed.hash.clone()),
            embedding_version: Some(version.to_string()),
            vector_id: Some(vector_id),
            nsfw_score: Some(0.0),
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    #[test]
    fn test_partition_detects_new_changed_unchanged() {
        let hashed = hash_rows(vec![row("a", "Alpha"), row("b", "Beta"), row("c", "Gamma")]);
        let version = "scripted:8:n1";

        let mut existing = HashMap::new();
        // "a" is current, "b" has a stale hash, "c" is absent.
        existing.insert("a".to_string(), committed_entry(&hashed[0], version, 1));
        let mut stale = committed_entry(&hashed[1], version, 2);
        stale.text_hash = Some("deadbeef".to_string());
        existing.insert("b".to_string(), stale);

        let (unchanged, pending) = partition_rows(&hashed, &existing, version);
        assert_eq!(unchanged.len(), 1);
        assert_eq!(unchanged[0].row.pg_id, "a");
        let pending_ids: Vec<_> = pending.iter().map(|h| h.row.pg_id.as_str()).collect();
        assert_eq!(pending_ids, vec!["b", "c"]);
    }

    #[test]
    fn test_version_bump_forces_reembed() {
        let hashed = hash_rows(vec![row("a", "Alpha")]);
        let mut existing = HashMap::new();
        existing.insert(
            "a".to_string(),
            committed_entry(&hashed[0], "old-model:8:n1", 1),
        );

        let (unchanged, pending) = partition_rows(&hashed, &existing, "new-model:8:n1");
        assert!(unchanged.is_empty());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_resync_of_unchanged_rows_embeds_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::Hnsw(LocalHnswStore::open(tmp.path(), 8, 16).unwrap());
        let embedder = ScriptedEmbedder::new(8);
        let spec = spec();

        // First run: both rows are new.
        let hashed = hash_rows(vec![row("a", "Alpha"), row("b", "Beta")]);
        let (_, pending) = partition_rows(&hashed, &HashMap::new(), embedder.version());
        let entries = index_rows(&store, &embedder, &spec, &pending, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(embedder.embed_calls.load(Ordering::SeqCst), 1);

        // Second run over the same upstream: nothing pending, so the
        // embedder is never consulted again.
        let existing: HashMap<String, SyncEntry> = entries
            .into_iter()
            .map(|e| (e.pg_id.clone(), e))
            .collect();
        let hashed = hash_rows(vec![row("a", "Alpha"), row("b", "Beta")]);
        let (unchanged, pending) = partition_rows(&hashed, &existing, embedder.version());
        assert_eq!(unchanged.len(), 2);
        assert!(pending.is_empty());
        assert_eq!(embedder.embed_calls.load(Ordering::SeqCst), 1);
        // Each row was embedded exactly once across both runs.
        assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_changed_row_reuses_state_link_and_store_stays_consistent() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::Hnsw(LocalHnswStore::open(tmp.path(), 8, 16).unwrap());
        let embedder = ScriptedEmbedder::new(8);
        let spec = spec();

        let hashed = hash_rows(vec![row("a", "Alpha")]);
        let (_, pending) = partition_rows(&hashed, &HashMap::new(), embedder.version());
        let first = index_rows(&store, &embedder, &spec, &pending, &HashMap::new())
            .await
            .unwrap();

        let existing: HashMap<String, SyncEntry> = first
            .iter()
            .map(|e| (e.pg_id.clone(), e.clone()))
            .collect();
        let hashed = hash_rows(vec![row("a", "Alpha Extended Cut")]);
        let (_, pending) = partition_rows(&hashed, &existing, embedder.version());
        assert_eq!(pending.len(), 1);

        let second = index_rows(&store, &embedder, &spec, &pending, &existing)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        // One live vector per key regardless of how often it changed.
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(second[0].text_hash, Some(hashed[0].hash.clone()));
    }

    #[tokio::test]
    async fn test_embed_outage_leaves_no_entries() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::Hnsw(LocalHnswStore::open(tmp.path(), 8, 16).unwrap());
        let mut embedder = ScriptedEmbedder::new(8);
        embedder.fail = true;
        let spec = spec();

        let hashed = hash_rows(vec![row("a", "Alpha")]);
        let (_, pending) = partition_rows(&hashed, &HashMap::new(), embedder.version());
        let err = index_rows(&store, &embedder, &spec, &pending, &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "EMBED_UNAVAILABLE");
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[test]
    fn test_build_payload_extracts_filterable_fields() {
        let mut extras = serde_json::Map::new();
        extras.insert("size".to_string(), Value::Number(7_000_000i64.into()));
        extras.insert("tmdb_id".to_string(), Value::Number(603.into()));
        extras.insert(
            "genres".to_string(),
            Value::String("Action, Science Fiction".to_string()),
        );
        let mut r = row("a", "The Matrix 1999 1080p BluRay");
        r.extras = extras;
        let hashed = hash_rows(vec![r]);

        let payload = build_payload(&spec(), &hashed[0], "bge-m3:8:n1", 0.12);
        assert_eq!(payload.size, Some(7_000_000));
        assert_eq!(payload.has_tmdb, Some(true));
        assert_eq!(payload.tmdb_id.as_deref(), Some("603"));
        assert_eq!(
            payload.genres,
            Some(vec!["Action".to_string(), "Science Fiction".to_string()])
        );
        assert_eq!(payload.nsfw_score, Some(0.12));
        assert_eq!(payload.content_type.as_deref(), Some("torrent"));
    }

    #[test]
    fn test_payload_without_tmdb_extra_is_not_enriched() {
        let hashed = hash_rows(vec![row("a", "Some Release")]);
        let payload = build_payload(&spec(), &hashed[0], "v", 0.0);
        assert_eq!(payload.has_tmdb, Some(false));
        assert_eq!(payload.tmdb_id, None);
    }
}
