//! Embedding generation
//!
//! An abstraction over embedding backends: the remote inference service
//! is the primary path, with an optional local fallback. The two report
//! distinct embedding versions so the state store never treats their
//! vectors as interchangeable.

mod http;
mod local;

pub use http::HttpEmbedder;
pub use local::LocalEmbedder;

use crate::config::EmbeddingConfig;
use crate::error::Result;
use async_trait::async_trait;
use tracing::warn;

/// Whether a text is embedded as a retrieval query or an indexed
/// document; controls the instruction prefix for retrieval-tuned models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedRole {
    Query,
    Document,
}

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts
    async fn embed(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>>;

    /// NSFW score in [0,1] per text
    async fn classify(&self, texts: &[String]) -> Result<Vec<f32>>;

    /// Embed and classify in one pass; backends with a combined
    /// endpoint override this.
    async fn infer(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, Vec<f32>)> {
        let embeddings = self.embed(texts, EmbedRole::Document).await?;
        let scores = self.classify(texts).await?;
        Ok((embeddings, scores))
    }

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Version tag stored with every vector this backend produces
    fn version(&self) -> &str;
}

/// Create an embedder based on configuration.
///
/// The remote backend wins when reachable; with `local_fallback` set an
/// unreachable remote degrades to a local model instead of failing.
pub async fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    let remote = HttpEmbedder::new(config)?;
    match remote.ping().await {
        Ok(()) => Ok(Box::new(remote)),
        Err(e) if config.local_fallback => {
            warn!(
                "embedding service unreachable ({}), falling back to local model",
                e
            );
            Ok(Box::new(LocalEmbedder::new(config)?))
        }
        Err(e) => Err(e),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedEmbedder;
    use super::*;

    #[tokio::test]
    async fn test_default_infer_combines_embed_and_classify() {
        let embedder = ScriptedEmbedder::new(8);
        let texts = vec!["one".to_string(), "two".to_string()];
        let (embeddings, scores) = embedder.infer(&texts).await.unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(scores.len(), 2);
        assert_eq!(embeddings[0].len(), 8);
    }
}
