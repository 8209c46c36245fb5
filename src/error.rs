//! Custom error types for hermes-index

use thiserror::Error;

/// Main error type for hermes-index operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Embedding backend unavailable: {0}")]
    EmbedUnavailable(String),

    #[error("Embedding backend over capacity: {0}")]
    EmbedBusy(String),

    #[error("Vector store unavailable: {0}")]
    VectorUnavailable(String),

    #[error("Vector dimension mismatch: {0}")]
    DimMismatch(String),

    #[error("Embedding version mismatch: {0}")]
    VersionMismatch(String),

    #[error("Row failed: {0}")]
    RowFailed(String),

    #[error("Query expansion timed out: {0}")]
    ExpandTimeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Empty query")]
    EmptyQuery,

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Enrichment error: {0}")]
    Enrichment(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

impl Error {
    /// Machine-readable error kind used in HTTP error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_INVALID",
            Error::Database(_) => "DB_UNAVAILABLE",
            Error::EmbedUnavailable(_) => "EMBED_UNAVAILABLE",
            Error::EmbedBusy(_) => "EMBED_BUSY",
            Error::VectorUnavailable(_) => "VECTOR_UNAVAILABLE",
            Error::DimMismatch(_) => "DIM_MISMATCH",
            Error::VersionMismatch(_) => "VERSION_MISMATCH",
            Error::RowFailed(_) => "ROW_FAILED",
            Error::ExpandTimeout(_) => "EXPAND_TIMEOUT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::EmptyQuery => "EMPTY_QUERY",
            Error::Cancelled(_) => "CANCELLED",
            Error::Enrichment(_) => "ROW_FAILED",
            Error::Io(_) => "VECTOR_UNAVAILABLE",
            Error::Http(_) => "EMBED_UNAVAILABLE",
            Error::UrlParse(_) => "CONFIG_INVALID",
            Error::Json(_) => "CONFIG_INVALID",
            Error::YamlParse(_) => "CONFIG_INVALID",
        }
    }

    /// Whether this error is a startup misconfiguration (exit code 1)
    /// rather than a runtime failure (exit code 2).
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::YamlParse(_) | Error::UrlParse(_) | Error::DimMismatch(_)
        )
    }
}

/// Result type alias for hermes-index
pub type Result<T> = std::result::Result<T, Error>;

/// Convert qdrant errors
impl From<qdrant_client::QdrantError> for Error {
    fn from(err: qdrant_client::QdrantError) -> Self {
        Error::VectorUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::EmptyQuery.kind(), "EMPTY_QUERY");
        assert_eq!(Error::Config("x".into()).kind(), "CONFIG_INVALID");
        assert_eq!(Error::DimMismatch("x".into()).kind(), "DIM_MISMATCH");
        assert_eq!(Error::EmbedBusy("x".into()).kind(), "EMBED_BUSY");
    }

    #[test]
    fn test_config_errors_are_startup_fatal() {
        assert!(Error::Config("bad".into()).is_config());
        assert!(Error::DimMismatch("768 vs 1024".into()).is_config());
        assert!(!Error::EmbedUnavailable("down".into()).is_config());
    }
}
