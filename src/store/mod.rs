//! Vector store abstraction
//!
//! A tagged variant over the two backends with one capability set:
//! ensure / upsert / query / delete / count / health. Scores come back
//! descending, ties broken by ascending id, on both variants.

mod hnsw;
mod payload;
mod remote;

pub use hnsw::LocalHnswStore;
pub use payload::{MetadataFilter, SearchHit, UpsertPoint, VectorPayload};
pub use remote::{stable_point_id, RemoteStore};

use crate::config::VectorStoreConfig;
use crate::error::{Error, Result};
use std::path::Path;

/// Polymorphic vector store
pub enum VectorStore {
    Hnsw(LocalHnswStore),
    Remote(RemoteStore),
}

/// Open the store described by the config and run the idempotent
/// `ensure` check against the configured dimension.
pub async fn create_vector_store(config: &VectorStoreConfig) -> Result<VectorStore> {
    let store = match config.kind.as_str() {
        "hnsw" => VectorStore::Hnsw(LocalHnswStore::open(
            Path::new(&config.path),
            config.dim,
            config.ef_search,
        )?),
        "remote" => VectorStore::Remote(RemoteStore::connect(config)?),
        other => {
            return Err(Error::Config(format!(
                "unknown vector_store.type: {}",
                other
            )));
        }
    };
    store.ensure(config.dim).await?;
    Ok(store)
}

impl VectorStore {
    pub async fn ensure(&self, dim: usize) -> Result<()> {
        match self {
            VectorStore::Hnsw(store) => store.ensure(dim),
            VectorStore::Remote(store) => store.ensure(dim).await,
        }
    }

    /// Atomic per batch: either every point lands or the state of the
    /// store is unchanged from the caller's perspective.
    pub async fn upsert(&self, points: Vec<UpsertPoint>) -> Result<Vec<i64>> {
        match self {
            VectorStore::Hnsw(store) => store.upsert(points),
            VectorStore::Remote(store) => store.upsert(points).await,
        }
    }

    pub async fn delete(&self, ids: &[i64]) -> Result<()> {
        match self {
            VectorStore::Hnsw(store) => store.delete(ids),
            VectorStore::Remote(store) => store.delete(ids).await,
        }
    }

    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        match self {
            VectorStore::Hnsw(store) => store.query(vector, k, filter),
            VectorStore::Remote(store) => store.query(vector, k, filter).await,
        }
    }

    pub async fn count(&self) -> Result<usize> {
        match self {
            VectorStore::Hnsw(store) => Ok(store.count()),
            VectorStore::Remote(store) => store.count().await,
        }
    }

    pub async fn health(&self) -> Result<()> {
        match self {
            VectorStore::Hnsw(store) => store.health(),
            VectorStore::Remote(store) => store.health().await,
        }
    }

    /// Backend tag for /status and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VectorStore::Hnsw(_) => "hnsw",
            VectorStore::Remote(_) => "remote",
        }
    }
}
