//! Payload schema attached to every vector

use serde::{Deserialize, Serialize};

/// Payload stored alongside each vector.
///
/// `source` + `pg_id` identify the upstream row; the remaining fields are
/// filterable at query time on backends that support payload filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    pub source: String,
    pub pg_id: String,
    pub text_hash: String,
    pub embedding_version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsfw_score: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_tmdb: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitles: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub genres: Option<Vec<String>>,
}

impl VectorPayload {
    pub fn new(
        source: String,
        pg_id: String,
        text_hash: String,
        embedding_version: String,
    ) -> Self {
        Self {
            source,
            pg_id,
            text_hash,
            embedding_version,
            nsfw_score: None,
            content_type: None,
            has_tmdb: None,
            tmdb_id: None,
            size: None,
            languages: None,
            subtitles: None,
            genres: None,
        }
    }
}

/// One vector heading into `upsert`. When `id` is `None` the store
/// allocates one; the returned id is authoritative either way.
#[derive(Debug, Clone)]
pub struct UpsertPoint {
    pub id: Option<i64>,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

/// Metadata filter applied at query time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    /// Keep only rows from this source
    pub source: Option<String>,

    /// Keep only rows with TMDB enrichment
    pub has_tmdb: Option<bool>,

    /// Drop rows whose nsfw_score is at or above this bound
    pub nsfw_score_below: Option<f32>,

    /// Keep only rows at least this many bytes
    pub size_min_bytes: Option<i64>,

    /// Keep rows matching any of these genres
    pub genres: Vec<String>,

    /// Keep only rows of this content type
    pub content_type: Option<String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.has_tmdb.is_none()
            && self.nsfw_score_below.is_none()
            && self.size_min_bytes.is_none()
            && self.genres.is_empty()
            && self.content_type.is_none()
    }

    /// In-process evaluation, used by the local HNSW store.
    pub fn matches(&self, payload: &VectorPayload) -> bool {
        if let Some(source) = &self.source {
            if payload.source != *source {
                return false;
            }
        }
        if let Some(wanted) = self.has_tmdb {
            if payload.has_tmdb.unwrap_or(false) != wanted {
                return false;
            }
        }
        if let Some(bound) = self.nsfw_score_below {
            if payload.nsfw_score.unwrap_or(0.0) >= bound {
                return false;
            }
        }
        if let Some(min) = self.size_min_bytes {
            if payload.size.unwrap_or(0) < min {
                return false;
            }
        }
        if !self.genres.is_empty() {
            let row_genres = payload.genres.as_deref().unwrap_or(&[]);
            if !self
                .genres
                .iter()
                .any(|g| row_genres.iter().any(|r| r.eq_ignore_ascii_case(g)))
            {
                return false;
            }
        }
        if let Some(ct) = &self.content_type {
            if payload.content_type.as_deref() != Some(ct.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One query result, ordered by descending similarity.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: i64,
    pub score: f32,
    pub payload: VectorPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(nsfw: f32, size: i64, has_tmdb: bool) -> VectorPayload {
        let mut p = VectorPayload::new(
            "bitmagnet_torrents".into(),
            "abc".into(),
            "hash".into(),
            "bge-m3:1024:n1".into(),
        );
        p.nsfw_score = Some(nsfw);
        p.size = Some(size);
        p.has_tmdb = Some(has_tmdb);
        p.genres = Some(vec!["Thriller".into()]);
        p
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = MetadataFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&payload(0.9, 0, false)));
    }

    #[test]
    fn test_nsfw_bound_is_exclusive_at_threshold() {
        let filter = MetadataFilter {
            nsfw_score_below: Some(0.7),
            ..Default::default()
        };
        assert!(filter.matches(&payload(0.69, 0, false)));
        assert!(!filter.matches(&payload(0.7, 0, false)));
        assert!(!filter.matches(&payload(0.9, 0, false)));
    }

    #[test]
    fn test_size_and_tmdb_filters() {
        let filter = MetadataFilter {
            has_tmdb: Some(true),
            size_min_bytes: Some(1_000_000),
            ..Default::default()
        };
        assert!(filter.matches(&payload(0.0, 2_000_000, true)));
        assert!(!filter.matches(&payload(0.0, 500, true)));
        assert!(!filter.matches(&payload(0.0, 2_000_000, false)));
    }

    #[test]
    fn test_source_filter_keeps_only_named_source() {
        let filter = MetadataFilter {
            source: Some("bitmagnet_torrents".into()),
            ..Default::default()
        };
        assert!(filter.matches(&payload(0.0, 0, false)));

        let filter = MetadataFilter {
            source: Some("content".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&payload(0.0, 0, false)));
    }

    #[test]
    fn test_genre_filter_matches_any_case_insensitively() {
        let filter = MetadataFilter {
            genres: vec!["thriller".into(), "Horror".into()],
            ..Default::default()
        };
        assert!(filter.matches(&payload(0.0, 0, false)));

        let filter = MetadataFilter {
            genres: vec!["Comedy".into()],
            ..Default::default()
        };
        assert!(!filter.matches(&payload(0.0, 0, false)));
    }

    #[test]
    fn test_payload_round_trips_through_json() {
        let p = payload(0.5, 42, true);
        let json = serde_json::to_string(&p).unwrap();
        let back: VectorPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
