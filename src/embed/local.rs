//! Local fallback embedder (fastembed)
//!
//! Used when the remote inference service is unreachable and the config
//! allows it. Reports a `+local` embedding version so its vectors are
//! never mixed with the remote model's. There is no local NSFW
//! classifier; scores come back as 0.0 and rows are treated as SFW
//! until the remote path re-embeds them.

use super::{EmbedRole, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::source::normalize::local_embedding_version;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    version: String,
    dim: usize,
    query_prefix: String,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        info!("initializing local fallback embedder: {}", config.model);

        let model_enum = match config.model.as_str() {
            "bge-m3" | "BAAI/bge-m3" => EmbeddingModel::BGEBaseENV15,
            "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "BAAI/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
            "BAAI/bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
            "sentence-transformers/all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
            _ => EmbeddingModel::BGESmallENV15,
        };

        let options = InitOptions::new(model_enum).with_show_download_progress(false);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| Error::EmbedUnavailable(format!("local model init failed: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            version: local_embedding_version(&config.model, config.dim),
            dim: config.dim,
            query_prefix: config.query_prefix.clone(),
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Vec<String> = match role {
            EmbedRole::Query if !self.query_prefix.is_empty() => texts
                .iter()
                .map(|t| format!("{}{}", self.query_prefix, t))
                .collect(),
            _ => texts.to_vec(),
        };

        // fastembed is synchronous; run it off the async worker threads.
        let model = self.model.clone();
        let embeddings = tokio::task::spawn_blocking(move || {
            let model = model.blocking_lock();
            model.embed(inputs, None)
        })
        .await
        .map_err(|e| Error::EmbedUnavailable(format!("embedding task join error: {}", e)))?
        .map_err(|e| Error::EmbedUnavailable(format!("local embedding failed: {}", e)))?;

        Ok(embeddings)
    }

    async fn classify(&self, texts: &[String]) -> Result<Vec<f32>> {
        Ok(vec![0.0; texts.len()])
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_version_is_distinct_from_remote() {
        use crate::source::normalize::embedding_version;
        let remote = embedding_version("bge-m3", 1024);
        let local = local_embedding_version("bge-m3", 1024);
        assert_ne!(remote, local);
        assert!(local.ends_with("+local"));
    }
}
