//! Local HNSW vector store
//!
//! Persists an `hnsw_rs` graph to disk next to an append-only JSON-lines
//! sidecar of `{id -> payload}` records. The sidecar is replayed into a
//! map on open; ids present in only one of graph/sidecar are treated as
//! absent, so recovery always converges on the intersection. A single
//! writer lock serializes mutation; readers search concurrently.

use crate::error::{Error, Result};
use crate::store::payload::{MetadataFilter, SearchHit, UpsertPoint, VectorPayload};
use hnsw_rs::hnswio::HnswIo;
use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const GRAPH_BASENAME: &str = "graph";
const SIDECAR_FILE: &str = "payloads.jsonl";
const MANIFEST_FILE: &str = "manifest.json";

const MAX_ELEMENTS: usize = 1_500_000;
const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;

/// Store manifest; pins the dimension so a restart with a different
/// model fails fast instead of silently mixing vector spaces.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    dim: usize,
    metric: String,
}

/// One sidecar record: a live payload or a tombstone.
#[derive(Debug, Serialize, Deserialize)]
struct SidecarRecord {
    id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<VectorPayload>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    deleted: bool,
}

struct HnswInner {
    graph: Hnsw<'static, f32, DistCosine>,
    payloads: HashMap<i64, VectorPayload>,
    key_index: HashMap<(String, String), i64>,
    next_id: i64,
    sidecar: File,
}

/// Local HNSW store handle
pub struct LocalHnswStore {
    dir: PathBuf,
    dim: usize,
    ef_search: usize,
    inner: RwLock<HnswInner>,
}

impl LocalHnswStore {
    /// Open (or create) the store at `dir` with the given dimension.
    pub fn open(dir: &Path, dim: usize, ef_search: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            let manifest: Manifest =
                serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;
            if manifest.dim != dim {
                return Err(Error::DimMismatch(format!(
                    "store at {} was built with dim {}, configured dim is {}",
                    dir.display(),
                    manifest.dim,
                    dim
                )));
            }
        } else {
            let manifest = Manifest {
                dim,
                metric: "cosine".to_string(),
            };
            std::fs::write(&manifest_path, serde_json::to_string(&manifest)?)?;
        }

        let graph_file = dir.join(format!("{}.hnsw.graph", GRAPH_BASENAME));
        let graph = if graph_file.exists() {
            // The reloader must outlive the graph it hands out, so it is
            // leaked once per open.
            let io = Box::leak(Box::new(HnswIo::new(dir, GRAPH_BASENAME)));
            io.load_hnsw::<f32, DistCosine>()
                .map_err(|e| Error::VectorUnavailable(format!("hnsw reload failed: {}", e)))?
        } else {
            Hnsw::<f32, DistCosine>::new(
                MAX_NB_CONNECTION,
                MAX_ELEMENTS,
                MAX_LAYER,
                EF_CONSTRUCTION,
                DistCosine {},
            )
        };

        let (mut payloads, live_records, deleted_records, mut next_id) =
            replay_sidecar(&dir.join(SIDECAR_FILE))?;

        if graph.get_nb_point() == 0 && !payloads.is_empty() {
            // Graph file lost or truncated: the sidecar ids have no
            // vectors behind them, so the intersection is empty.
            warn!(
                "discarding {} sidecar payloads with no backing graph at {}",
                payloads.len(),
                dir.display()
            );
            payloads.clear();
        }

        if deleted_records > live_records {
            compact_sidecar(&dir.join(SIDECAR_FILE), &payloads)?;
        }

        let mut key_index = HashMap::new();
        for (id, payload) in &payloads {
            key_index.insert((payload.source.clone(), payload.pg_id.clone()), *id);
            next_id = next_id.max(id + 1);
        }

        info!(
            "local hnsw store open at {} ({} vectors, dim {})",
            dir.display(),
            payloads.len(),
            dim
        );

        let sidecar = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(SIDECAR_FILE))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            dim,
            ef_search,
            inner: RwLock::new(HnswInner {
                graph,
                payloads,
                key_index,
                next_id,
                sidecar,
            }),
        })
    }

    /// Idempotent dimension check; the heavy lifting happens in `open`.
    pub fn ensure(&self, dim: usize) -> Result<()> {
        if dim != self.dim {
            return Err(Error::DimMismatch(format!(
                "store dim {} vs requested {}",
                self.dim, dim
            )));
        }
        Ok(())
    }

    /// Insert or replace a batch of vectors. Returns the authoritative
    /// id per point, in input order.
    ///
    /// The graph cannot replace a point in place, so re-upserting a live
    /// key tombstones the old id and inserts under a fresh one; callers
    /// must persist the returned ids.
    pub fn upsert(&self, points: Vec<UpsertPoint>) -> Result<Vec<i64>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        for point in &points {
            if point.vector.len() != self.dim {
                return Err(Error::DimMismatch(format!(
                    "vector for {}:{} has dim {}, store expects {}",
                    point.payload.source,
                    point.payload.pg_id,
                    point.vector.len(),
                    self.dim
                )));
            }
        }

        let mut inner = self.inner.write();
        let mut ids = Vec::with_capacity(points.len());
        let mut records = Vec::new();

        for point in points {
            let key = (point.payload.source.clone(), point.payload.pg_id.clone());
            let existing = inner.key_index.get(&key).copied().or(point.id);

            if let Some(old_id) = existing {
                if inner.payloads.remove(&old_id).is_some() {
                    records.push(SidecarRecord {
                        id: old_id,
                        payload: None,
                        deleted: true,
                    });
                }
                inner.next_id = inner.next_id.max(old_id + 1);
            }

            let id = inner.next_id;
            inner.next_id += 1;

            inner.graph.insert((&point.vector, id as usize));
            inner.payloads.insert(id, point.payload.clone());
            inner.key_index.insert(key, id);
            records.push(SidecarRecord {
                id,
                payload: Some(point.payload),
                deleted: false,
            });
            ids.push(id);
        }

        for record in &records {
            let line = serde_json::to_string(record)?;
            writeln!(inner.sidecar, "{}", line)?;
        }
        inner.sidecar.flush()?;

        inner
            .graph
            .file_dump(&self.dir, GRAPH_BASENAME)
            .map_err(|e| Error::VectorUnavailable(format!("hnsw dump failed: {}", e)))?;

        debug!("upserted {} vectors into local hnsw", ids.len());
        Ok(ids)
    }

    /// Tombstone the given ids. The graph entries linger until the next
    /// sidecar compaction but never surface in results.
    pub fn delete(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        for id in ids {
            if let Some(payload) = inner.payloads.remove(id) {
                inner
                    .key_index
                    .remove(&(payload.source.clone(), payload.pg_id.clone()));
                let line = serde_json::to_string(&SidecarRecord {
                    id: *id,
                    payload: None,
                    deleted: true,
                })?;
                writeln!(inner.sidecar, "{}", line)?;
            }
        }
        inner.sidecar.flush()?;
        Ok(())
    }

    /// K-nearest search with optional payload filtering.
    ///
    /// Results are ordered by descending score, ties broken by ascending
    /// id. Tombstoned graph labels are skipped.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        if vector.len() != self.dim {
            return Err(Error::DimMismatch(format!(
                "query vector has dim {}, store expects {}",
                vector.len(),
                self.dim
            )));
        }

        let inner = self.inner.read();
        if inner.payloads.is_empty() {
            return Ok(Vec::new());
        }

        // Over-fetch when filtering so post-filter results can still
        // fill k.
        let need = if filter.map_or(false, |f| !f.is_empty()) {
            (k * 4).max(k + 16)
        } else {
            k
        };
        let need = need.min(inner.payloads.len().max(1));
        let ef = self.ef_search.max(need);

        let neighbours = inner.graph.search(vector, need, ef);

        let mut hits: Vec<SearchHit> = neighbours
            .into_iter()
            .filter_map(|n| {
                let id = n.d_id as i64;
                let payload = inner.payloads.get(&id)?;
                if let Some(f) = filter {
                    if !f.matches(payload) {
                        return None;
                    }
                }
                Some(SearchHit {
                    id,
                    score: 1.0 - n.distance,
                    payload: payload.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of live vectors.
    pub fn count(&self) -> usize {
        self.inner.read().payloads.len()
    }

    pub fn health(&self) -> Result<()> {
        Ok(())
    }
}

type ReplayResult = (HashMap<i64, VectorPayload>, usize, usize, i64);

fn replay_sidecar(path: &Path) -> Result<ReplayResult> {
    let mut payloads = HashMap::new();
    let mut live = 0usize;
    let mut deleted = 0usize;
    let mut next_id = 0i64;

    if !path.exists() {
        return Ok((payloads, live, deleted, next_id));
    }

    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SidecarRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                // A torn tail write from a crash; everything before it
                // already replayed.
                warn!("skipping malformed sidecar line: {}", e);
                continue;
            }
        };
        next_id = next_id.max(record.id + 1);
        if record.deleted {
            payloads.remove(&record.id);
            deleted += 1;
        } else if let Some(payload) = record.payload {
            payloads.insert(record.id, payload);
            live += 1;
        }
    }

    Ok((payloads, live, deleted, next_id))
}

fn compact_sidecar(path: &Path, payloads: &HashMap<i64, VectorPayload>) -> Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut out = File::create(&tmp)?;
        let mut ids: Vec<_> = payloads.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let record = SidecarRecord {
                id,
                payload: payloads.get(&id).cloned(),
                deleted: false,
            };
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        }
        out.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    debug!("compacted sidecar at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn point(source: &str, pg_id: &str, vector: Vec<f32>) -> UpsertPoint {
        UpsertPoint {
            id: None,
            vector,
            payload: VectorPayload::new(
                source.to_string(),
                pg_id.to_string(),
                "hash".to_string(),
                "test:4:n1".to_string(),
            ),
        }
    }

    #[test]
    fn test_upsert_allocates_sequential_ids() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();

        let ids = store
            .upsert(vec![
                point("s", "a", vec![1.0, 0.0, 0.0, 0.0]),
                point("s", "b", vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .unwrap();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_reupsert_same_key_replaces_and_reallocates() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();

        let first = store
            .upsert(vec![point("s", "a", vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        let second = store
            .upsert(vec![point("s", "a", vec![0.0, 1.0, 0.0, 0.0])])
            .unwrap();
        assert_ne!(first[0], second[0]);
        assert_eq!(store.count(), 1);

        // The old label never surfaces in results.
        let hits = store.query(&[1.0, 0.0, 0.0, 0.0], 5, None).unwrap();
        assert!(hits.iter().all(|h| h.id == second[0]));
    }

    #[test]
    fn test_query_orders_by_score_then_id() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();

        store
            .upsert(vec![
                point("s", "a", vec![1.0, 0.0, 0.0, 0.0]),
                point("s", "b", vec![1.0, 0.0, 0.0, 0.0]),
                point("s", "c", vec![0.0, 0.0, 1.0, 0.0]),
            ])
            .unwrap();

        let hits = store.query(&[1.0, 0.0, 0.0, 0.0], 3, None).unwrap();
        assert_eq!(hits.len(), 3);
        // Two identical vectors tie; ascending id breaks the tie.
        assert!(hits[0].score >= hits[1].score);
        assert_eq!((hits[0].id, hits[1].id), (0, 1));
        assert!(hits[2].score < hits[1].score);
    }

    #[test]
    fn test_filter_excludes_nsfw() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();

        let mut clean = point("s", "clean", vec![1.0, 0.0, 0.0, 0.0]);
        clean.payload.nsfw_score = Some(0.1);
        let mut nsfw = point("s", "nsfw", vec![1.0, 0.0, 0.0, 0.0]);
        nsfw.payload.nsfw_score = Some(0.95);
        store.upsert(vec![clean, nsfw]).unwrap();

        let filter = MetadataFilter {
            nsfw_score_below: Some(0.7),
            ..Default::default()
        };
        let hits = store
            .query(&[1.0, 0.0, 0.0, 0.0], 5, Some(&filter))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.pg_id, "clean");
    }

    #[test]
    fn test_reopen_replays_sidecar() {
        let tmp = TempDir::new().unwrap();
        {
            let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();
            store
                .upsert(vec![
                    point("s", "a", vec![1.0, 0.0, 0.0, 0.0]),
                    point("s", "b", vec![0.0, 1.0, 0.0, 0.0]),
                ])
                .unwrap();
        }

        let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();
        assert_eq!(store.count(), 2);
        let hits = store.query(&[0.0, 1.0, 0.0, 0.0], 1, None).unwrap();
        assert_eq!(hits[0].payload.pg_id, "b");
    }

    #[test]
    fn test_reopen_with_other_dim_fails() {
        let tmp = TempDir::new().unwrap();
        {
            LocalHnswStore::open(tmp.path(), 768, 16).unwrap();
        }
        let err = LocalHnswStore::open(tmp.path(), 1024, 16).unwrap_err();
        assert_eq!(err.kind(), "DIM_MISMATCH");
    }

    #[test]
    fn test_delete_tombstones_ids() {
        let tmp = TempDir::new().unwrap();
        let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();
        let ids = store
            .upsert(vec![point("s", "a", vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        store.delete(&ids).unwrap();
        assert_eq!(store.count(), 0);
        assert!(store.query(&[1.0, 0.0, 0.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_torn_sidecar_tail_is_ignored() {
        let tmp = TempDir::new().unwrap();
        {
            let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();
            store
                .upsert(vec![point("s", "a", vec![1.0, 0.0, 0.0, 0.0])])
                .unwrap();
        }
        // Simulate a crash mid-append.
        let sidecar = tmp.path().join(SIDECAR_FILE);
        let mut file = OpenOptions::new().append(true).open(&sidecar).unwrap();
        write!(file, "{{\"id\":99,\"payl").unwrap();
        drop(file);

        let store = LocalHnswStore::open(tmp.path(), 4, 16).unwrap();
        assert_eq!(store.count(), 1);
    }
}
