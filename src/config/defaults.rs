//! Default values for configuration

/// Default schema holding hermes-owned tables
pub fn default_schema() -> String {
    "hermes".to_string()
}

/// Default vector store kind
pub fn default_store_kind() -> String {
    "hnsw".to_string()
}

/// Default on-disk path for the local HNSW store
pub fn default_store_path() -> String {
    "data/vector_store".to_string()
}

/// Default remote store URL (qdrant gRPC port)
pub fn default_store_url() -> String {
    std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6334".to_string())
}

/// Default remote collection name
pub fn default_collection() -> String {
    "hermes_index".to_string()
}

/// Default search timeout against the remote store
pub fn default_store_timeout_seconds() -> f64 {
    10.0
}

/// Default timeout for remote store metadata calls
pub fn default_store_http_timeout_seconds() -> f64 {
    5.0
}

/// Default ef parameter for HNSW queries
pub fn default_ef_search() -> usize {
    64
}

/// Default embedding service URL
pub fn default_embedding_url() -> String {
    "http://127.0.0.1:8001".to_string()
}

/// Default embedding model identifier
pub fn default_embedding_model() -> String {
    "bge-m3".to_string()
}

/// Default embedding dimension for bge-m3
pub fn default_embedding_dim() -> usize {
    1024
}

/// Default per-call timeout against the embedding service
pub fn default_embedding_timeout_seconds() -> f64 {
    60.0
}

/// Default maximum texts per embedding request
pub fn default_embedding_max_batch() -> usize {
    64
}

/// Default cap on concurrent embedding requests
pub fn default_embedding_max_in_flight() -> usize {
    4
}

/// Default bound on callers queued behind the in-flight cap
pub fn default_embedding_queue_depth() -> usize {
    32
}

/// Default retrieval prefix for bge-family query embeddings
pub fn default_query_prefix() -> String {
    "为这个句子生成用于检索的向量: ".to_string()
}

/// Default NSFW score above which a row is considered NSFW
pub fn default_nsfw_threshold() -> f32 {
    0.7
}

/// Default sync batch size
pub fn default_batch_size() -> usize {
    128
}

/// Default seconds between sync cycles in loop mode
pub fn default_sync_interval_seconds() -> u64 {
    30
}

/// Default result count for /search
pub fn default_topk() -> usize {
    20
}

/// Default over-fetch window for merging and pagination
pub fn default_fetch_k() -> usize {
    100
}

/// Default total time budget for one search request
pub fn default_gpu_timeout_seconds() -> f64 {
    15.0
}

/// Default for the exclude_nsfw search parameter
pub fn default_exclude_nsfw() -> bool {
    true
}

/// Default TMDB API base URL
pub fn default_tmdb_base_url() -> String {
    "https://api.themoviedb.org/3".to_string()
}

/// Default TMDB metadata language
pub fn default_tmdb_language() -> String {
    "zh-CN".to_string()
}

/// Default environment variable holding the TMDB API key
pub fn default_tmdb_api_key_env() -> String {
    "TMDB_API_KEY".to_string()
}

/// Default candidate limit per enrichment pass
pub fn default_tmdb_limit() -> usize {
    500
}

/// Default sleep between enrichment passes in loop mode
pub fn default_tmdb_sleep_seconds() -> f64 {
    1.0
}

/// Default per-request timeout against the TMDB API
pub fn default_tmdb_timeout_seconds() -> f64 {
    10.0
}

/// Default TMDB requests per second (token bucket)
pub fn default_tmdb_rate_per_second() -> u32 {
    4
}

/// Default budget for the enrichment-backed query expansion
pub fn default_query_expand_timeout_ms() -> u64 {
    1500
}

/// Default enrichment rows consulted during expansion
pub fn default_query_expand_limit() -> usize {
    20
}

/// Expansion is on unless disabled
pub fn default_query_expand() -> bool {
    true
}

/// Default actors kept per enrichment row
pub fn default_limit_actors() -> usize {
    10
}

/// Default directors kept per enrichment row
pub fn default_limit_directors() -> usize {
    5
}

/// Default alternative titles kept per enrichment row
pub fn default_limit_aka() -> usize {
    10
}

/// Default HTTP bind address for the search API
pub fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// Default token TTL for the externally handled auth layer
pub fn default_token_ttl_seconds() -> u64 {
    86400
}
