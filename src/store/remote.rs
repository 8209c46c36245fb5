//! Remote collection-based vector store (qdrant)

use crate::config::VectorStoreConfig;
use crate::error::{Error, Result};
use crate::store::payload::{MetadataFilter, SearchHit, UpsertPoint, VectorPayload};
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    GetCollectionInfoResponse, PointId, PointStruct, Range, ScoredPoint, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

/// Remote store handle
pub struct RemoteStore {
    client: Qdrant,
    collection: String,
    dim: usize,
}

impl RemoteStore {
    pub fn connect(config: &VectorStoreConfig) -> Result<Self> {
        debug!("Connecting to remote vector store at {}", config.url);

        let client = Qdrant::from_url(&config.url)
            .timeout(std::time::Duration::from_secs_f64(config.timeout_seconds))
            .connect_timeout(std::time::Duration::from_secs_f64(
                config.http_timeout_seconds,
            ))
            .skip_compatibility_check()
            .build()
            .map_err(|e| Error::VectorUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            collection: config.collection.clone(),
            dim: config.dim,
        })
    }

    /// Ensure the collection exists with the configured dimension.
    pub async fn ensure(&self, dim: usize) -> Result<()> {
        if dim != self.dim {
            return Err(Error::DimMismatch(format!(
                "store configured for dim {}, requested {}",
                self.dim, dim
            )));
        }

        if self.client.collection_exists(&self.collection).await? {
            if let Some(size) = self.collection_vector_size().await? {
                if size != self.dim {
                    return Err(Error::DimMismatch(format!(
                        "collection '{}' has vector size {}, configured dim is {}",
                        self.collection, size, self.dim
                    )));
                }
            }
            return Ok(());
        }

        info!(
            "creating collection {} with dimension {}",
            self.collection, self.dim
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(self.dim as u64, Distance::Cosine),
                ),
            )
            .await?;
        Ok(())
    }

    /// Insert or replace a batch of vectors. Ids omitted by the caller
    /// are derived from the payload key, so re-upserts land on the same
    /// point across restarts.
    pub async fn upsert(&self, points: Vec<UpsertPoint>) -> Result<Vec<i64>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(points.len());
        let mut structs = Vec::with_capacity(points.len());

        for point in points {
            if point.vector.len() != self.dim {
                return Err(Error::DimMismatch(format!(
                    "vector for {}:{} has dim {}, store expects {}",
                    point.payload.source,
                    point.payload.pg_id,
                    point.vector.len(),
                    self.dim
                )));
            }
            let id = point
                .id
                .unwrap_or_else(|| stable_point_id(&point.payload.source, &point.payload.pg_id));
            ids.push(id);
            structs.push(PointStruct::new(
                id as u64,
                point.vector,
                payload_to_qdrant(&point.payload)?,
            ));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, structs))
            .await?;
        Ok(ids)
    }

    pub async fn delete(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let points: Vec<PointId> = ids.iter().map(|id| PointId::from(*id as u64)).collect();
        self.client
            .delete_points(DeletePointsBuilder::new(&self.collection).points(points))
            .await?;
        Ok(())
    }

    /// Vector search with the filter translated into the backend's
    /// payload-filter grammar.
    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        let mut builder =
            SearchPointsBuilder::new(&self.collection, vector.to_vec(), k as u64).with_payload(true);

        if let Some(f) = filter {
            if let Some(qdrant_filter) = to_qdrant_filter(f) {
                builder = builder.filter(qdrant_filter);
            }
        }

        let response = self.client.search_points(builder).await?;

        let mut hits: Vec<SearchHit> = response
            .result
            .into_iter()
            .filter_map(scored_point_to_hit)
            .collect();

        // The backend orders by score; re-apply the id tie-break so the
        // contract holds regardless of backend behavior.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        Ok(hits)
    }

    pub async fn count(&self) -> Result<usize> {
        if !self.client.collection_exists(&self.collection).await? {
            return Ok(0);
        }
        let info = self.client.collection_info(&self.collection).await?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0) as usize)
    }

    pub async fn health(&self) -> Result<()> {
        self.client.health_check().await?;
        Ok(())
    }

    async fn collection_vector_size(&self) -> Result<Option<usize>> {
        let info = self.client.collection_info(&self.collection).await?;
        Ok(extract_vector_size(&info))
    }
}

/// Stable 63-bit point id derived from the payload key.
pub fn stable_point_id(source: &str, pg_id: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(pg_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) & 0x7fff_ffff_ffff_ffff) as i64
}

fn extract_vector_size(info: &GetCollectionInfoResponse) -> Option<usize> {
    let params = info
        .result
        .as_ref()?
        .config
        .as_ref()?
        .params
        .as_ref()?
        .vectors_config
        .as_ref()?
        .config
        .as_ref()?;
    match params {
        qdrant_client::qdrant::vectors_config::Config::Params(p) => Some(p.size as usize),
        qdrant_client::qdrant::vectors_config::Config::ParamsMap(map) => map
            .map
            .values()
            .next()
            .map(|p| p.size as usize),
    }
}

fn to_qdrant_filter(filter: &MetadataFilter) -> Option<Filter> {
    let mut must: Vec<Condition> = Vec::new();

    if let Some(source) = &filter.source {
        must.push(Condition::matches("source", source.clone()));
    }
    if let Some(true) = filter.has_tmdb {
        must.push(Condition::matches("has_tmdb", true));
    }
    if let Some(bound) = filter.nsfw_score_below {
        must.push(Condition::range(
            "nsfw_score",
            Range {
                lt: Some(bound as f64),
                ..Default::default()
            },
        ));
    }
    if let Some(min) = filter.size_min_bytes {
        must.push(Condition::range(
            "size",
            Range {
                gte: Some(min as f64),
                ..Default::default()
            },
        ));
    }
    if !filter.genres.is_empty() {
        must.push(Condition::matches("genres", filter.genres.clone()));
    }
    if let Some(ct) = &filter.content_type {
        must.push(Condition::matches("content_type", ct.clone()));
    }

    if must.is_empty() {
        return None;
    }

    Some(Filter {
        must,
        should: vec![],
        must_not: vec![],
        min_should: None,
    })
}

fn payload_to_qdrant(payload: &VectorPayload) -> Result<HashMap<String, QdrantValue>> {
    let json = serde_json::to_value(payload)?;
    let Value::Object(map) = json else {
        return Err(Error::VectorUnavailable(
            "payload did not serialize to an object".to_string(),
        ));
    };
    Ok(map
        .into_iter()
        .map(|(k, v)| (k, json_to_qdrant_value(v)))
        .collect())
}

fn scored_point_to_hit(point: ScoredPoint) -> Option<SearchHit> {
    let id = match point.id?.point_id_options? {
        qdrant_client::qdrant::point_id::PointIdOptions::Num(num) => num as i64,
        qdrant_client::qdrant::point_id::PointIdOptions::Uuid(_) => return None,
    };
    let json: serde_json::Map<String, Value> = point
        .payload
        .into_iter()
        .map(|(k, v)| (k, json_from_qdrant_value(v)))
        .collect();
    let payload: VectorPayload = serde_json::from_value(Value::Object(json)).ok()?;
    Some(SearchHit {
        id,
        score: point.score,
        payload,
    })
}

fn json_to_qdrant_value(v: Value) -> QdrantValue {
    use qdrant_client::qdrant::value::Kind;

    let kind = match v {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Kind::IntegerValue(i)
            } else {
                Kind::DoubleValue(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Kind::StringValue(s),
        Value::Array(items) => Kind::ListValue(qdrant_client::qdrant::ListValue {
            values: items.into_iter().map(json_to_qdrant_value).collect(),
        }),
        Value::Object(map) => Kind::StructValue(qdrant_client::qdrant::Struct {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, json_to_qdrant_value(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

fn json_from_qdrant_value(v: QdrantValue) -> Value {
    use qdrant_client::qdrant::value::Kind;

    match v.kind {
        Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => Value::Array(
            list.values
                .into_iter()
                .map(json_from_qdrant_value)
                .collect(),
        ),
        Some(Kind::StructValue(s)) => Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, json_from_qdrant_value(v)))
                .collect(),
        ),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_point_id_is_deterministic_and_positive() {
        let a = stable_point_id("bitmagnet_torrents", "abc123");
        let b = stable_point_id("bitmagnet_torrents", "abc123");
        assert_eq!(a, b);
        assert!(a >= 0);
        assert_ne!(a, stable_point_id("bitmagnet_torrents", "abc124"));
        assert_ne!(a, stable_point_id("content", "abc123"));
    }

    #[test]
    fn test_filter_translation_covers_all_keys() {
        let filter = MetadataFilter {
            source: Some("bitmagnet_torrents".into()),
            has_tmdb: Some(true),
            nsfw_score_below: Some(0.7),
            size_min_bytes: Some(1024),
            genres: vec!["Thriller".into()],
            content_type: Some("movie".into()),
        };
        let qdrant_filter = to_qdrant_filter(&filter).unwrap();
        assert_eq!(qdrant_filter.must.len(), 6);
    }

    #[test]
    fn test_empty_filter_translates_to_none() {
        assert!(to_qdrant_filter(&MetadataFilter::default()).is_none());
    }

    #[test]
    fn test_payload_survives_qdrant_value_round_trip() {
        let mut payload = VectorPayload::new(
            "content".into(),
            "movie:tmdb:603".into(),
            "hash".into(),
            "bge-m3:1024:n1".into(),
        );
        payload.nsfw_score = Some(0.05);
        payload.has_tmdb = Some(true);
        payload.size = Some(7_000_000_000);
        payload.genres = Some(vec!["Action".into(), "Science Fiction".into()]);

        let map = payload_to_qdrant(&payload).unwrap();
        let json: serde_json::Map<String, Value> = map
            .into_iter()
            .map(|(k, v)| (k, json_from_qdrant_value(v)))
            .collect();
        let back: VectorPayload = serde_json::from_value(Value::Object(json)).unwrap();
        assert_eq!(back, payload);
    }
}
