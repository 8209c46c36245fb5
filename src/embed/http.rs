//! HTTP embedding backend
//!
//! Talks to the remote inference service: `/infer` returns embeddings
//! plus NSFW scores in one pass, `/embed` and `/classify` cover the
//! single-purpose calls. Requests are chunked to `max_batch`, retried
//! with bounded backoff on transient failures, and capped to
//! `max_in_flight` concurrent calls with a bounded wait queue.

use super::{EmbedRole, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::source::normalize::embedding_version;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;
use url::Url;

const MAX_ATTEMPTS: usize = 3;
const BACKOFF_BASE_MS: u64 = 300;

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    nsfw_scores: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    nsfw_scores: Vec<f32>,
}

pub struct HttpEmbedder {
    client: Client,
    base_url: Url,
    version: String,
    dim: usize,
    max_batch: usize,
    query_prefix: String,
    document_prefix: String,
    in_flight: Semaphore,
    waiting: AtomicUsize,
    queue_depth: usize,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url,
            version: embedding_version(&config.model, config.dim),
            dim: config.dim,
            max_batch: config.max_batch.max(1),
            query_prefix: config.query_prefix.clone(),
            document_prefix: config.document_prefix.clone(),
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            waiting: AtomicUsize::new(0),
            queue_depth: config.queue_depth,
        })
    }

    /// Cheap reachability probe used at startup.
    pub async fn ping(&self) -> Result<()> {
        let url = self.endpoint("/health")?;
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| Error::EmbedUnavailable(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| Error::EmbedUnavailable(e.to_string()))?;
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("invalid embedding backend URL: {}", e)))
    }

    /// Take an in-flight slot. Callers beyond the cap queue up to
    /// `queue_depth` deep, then fail fast.
    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        if let Ok(permit) = self.in_flight.try_acquire() {
            return Ok(permit);
        }
        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        if queued >= self.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::EmbedBusy(format!(
                "{} callers already queued",
                queued
            )));
        }
        let permit = self.in_flight.acquire().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| Error::EmbedUnavailable("embedding client closed".to_string()))
    }

    async fn post_chunk<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        texts: &[String],
    ) -> Result<T> {
        let _permit = self.acquire().await?;
        let url = self.endpoint(path)?;
        let mut last_err: Option<Error> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS * attempt as u64)).await;
            }
            let request = self
                .client
                .post(url.clone())
                .json(&InferRequest { texts });
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if matches!(
                        status,
                        StatusCode::BAD_GATEWAY
                            | StatusCode::SERVICE_UNAVAILABLE
                            | StatusCode::GATEWAY_TIMEOUT
                    ) {
                        last_err = Some(Error::EmbedUnavailable(format!(
                            "HTTP {} from embedding service",
                            status
                        )));
                        continue;
                    }
                    match response.error_for_status() {
                        Ok(ok) => {
                            return ok
                                .json::<T>()
                                .await
                                .map_err(|e| Error::EmbedUnavailable(e.to_string()));
                        }
                        Err(e) => {
                            // 4xx is not transient; bail immediately.
                            return Err(Error::EmbedUnavailable(e.to_string()));
                        }
                    }
                }
                Err(e) => last_err = Some(Error::EmbedUnavailable(e.to_string())),
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::EmbedUnavailable("embedding request failed".to_string())))
    }

    fn validate_dim(&self, embeddings: &[Vec<f32>]) -> Result<()> {
        if let Some(bad) = embeddings.iter().find(|v| v.len() != self.dim) {
            return Err(Error::EmbedUnavailable(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dim,
                bad.len()
            )));
        }
        Ok(())
    }

    fn apply_prefix(&self, texts: &[String], role: EmbedRole) -> Vec<String> {
        let prefix = match role {
            EmbedRole::Query => &self.query_prefix,
            EmbedRole::Document => &self.document_prefix,
        };
        if prefix.is_empty() {
            return texts.to_vec();
        }
        texts.iter().map(|t| format!("{}{}", prefix, t)).collect()
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let prefixed = self.apply_prefix(texts, role);
        let mut all = Vec::with_capacity(prefixed.len());
        for chunk in prefixed.chunks(self.max_batch) {
            let response: InferResponse = self.post_chunk("/embed", chunk).await?;
            self.validate_dim(&response.embeddings)?;
            all.extend(response.embeddings);
        }
        debug!("embedded {} texts via remote backend", all.len());
        Ok(all)
    }

    async fn classify(&self, texts: &[String]) -> Result<Vec<f32>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.max_batch) {
            let response: ClassifyResponse = self.post_chunk("/classify", chunk).await?;
            all.extend(response.nsfw_scores);
        }
        Ok(all)
    }

    async fn infer(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, Vec<f32>)> {
        if texts.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let prefixed = self.apply_prefix(texts, EmbedRole::Document);
        let mut embeddings = Vec::with_capacity(prefixed.len());
        let mut scores = Vec::with_capacity(prefixed.len());
        for chunk in prefixed.chunks(self.max_batch) {
            let response: InferResponse = self.post_chunk("/infer", chunk).await?;
            self.validate_dim(&response.embeddings)?;
            if response.nsfw_scores.len() != response.embeddings.len() {
                return Err(Error::EmbedUnavailable(format!(
                    "infer returned {} embeddings but {} scores",
                    response.embeddings.len(),
                    response.nsfw_scores.len()
                )));
            }
            embeddings.extend(response.embeddings);
            scores.extend(response.nsfw_scores);
        }
        Ok((embeddings, scores))
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

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig {
            url: "http://127.0.0.1:1".to_string(),
            model: "bge-m3".to_string(),
            dim: 1024,
            max_in_flight: 1,
            queue_depth: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_version_tag_from_config() {
        let embedder = HttpEmbedder::new(&test_config()).unwrap();
        assert_eq!(embedder.version(), "bge-m3:1024:n1");
        assert_eq!(embedder.dimension(), 1024);
    }

    #[test]
    fn test_prefix_applied_per_role() {
        let mut config = test_config();
        config.query_prefix = "q: ".to_string();
        config.document_prefix = String::new();
        let embedder = HttpEmbedder::new(&config).unwrap();

        let texts = vec!["hello".to_string()];
        assert_eq!(embedder.apply_prefix(&texts, EmbedRole::Query), vec!["q: hello"]);
        assert_eq!(embedder.apply_prefix(&texts, EmbedRole::Document), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_over_cap_callers_fail_busy() {
        let embedder = HttpEmbedder::new(&test_config()).unwrap();
        // Hold the only slot, leaving a zero-depth queue.
        let _held = embedder.in_flight.try_acquire().unwrap();
        let err = embedder.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "EMBED_BUSY");
    }
}
