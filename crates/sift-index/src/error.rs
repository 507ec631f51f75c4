//! Error types for sift-index.

/// Errors that can occur while indexing or querying a repository.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading sources or snapshot files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `SQLite` result-cache error.
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("cache migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// LLM provider error (embedding or completion).
    #[error("LLM error: {0}")]
    Llm(#[from] sift_llm::LlmError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Vector file encode/decode error.
    #[error("vector file error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Tree-sitter parsing error.
    #[error("parse failed: {0}")]
    Parse(String),

    /// No grammar is compiled in for the language.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Persisted snapshot files disagree with each other.
    #[error("snapshot mismatch: {0}")]
    SnapshotMismatch(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
