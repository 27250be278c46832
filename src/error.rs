//! Error types for the metadata vectorizer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::retry::Retryable;

/// Coarse classification shared by every error that can reach a caller
/// through the daemon protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Another extraction is already active for the project.
    Conflict,
    /// The request itself is invalid and must not be retried.
    Validation,
    /// The referenced run or generation does not exist.
    NotFound,
    /// Anything else.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Errors raised while reading a warehouse catalog.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("catalog rate limited: {0}")]
    RateLimited(String),

    #[error("catalog temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("catalog authentication failed: {0}")]
    Unauthorized(String),

    #[error("catalog object not found: {0}")]
    NotFound(String),

    #[error("catalog request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("catalog database error: {0}")]
    Database(String),

    #[error("catalog parse error: {0}")]
    ParseError(String),

    #[error("catalog IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("catalog misconfigured: {0}")]
    Configuration(String),
}

impl SourceError {
    /// Map an upstream HTTP status to the matching error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => SourceError::RateLimited(body),
            401 | 403 => SourceError::Unauthorized(format!("status {status}: {body}")),
            404 => SourceError::NotFound(body),
            500..=599 => SourceError::Unavailable(format!("status {status}: {body}")),
            _ => SourceError::ParseError(format!("unexpected status {status}: {body}")),
        }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            SourceError::RateLimited(_) | SourceError::Unavailable(_) => true,
            SourceError::RequestError(e) => e.is_timeout() || e.is_connect(),
            SourceError::Database(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timed out") || msg.contains("connection")
            }
            SourceError::Unauthorized(_)
            | SourceError::NotFound(_)
            | SourceError::ParseError(_)
            | SourceError::IoError(_)
            | SourceError::Configuration(_) => false,
        }
    }
}

/// Errors related to embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to connect to embedding provider: {0}")]
    ConnectionError(String),

    #[error("embedding provider rate limited: {0}")]
    RateLimited(String),

    #[error("embedding provider error (status {status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("embedding request rejected (status {status}): {body}")]
    ClientError { status: u16, body: String },

    #[error("embedding request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding provider misconfigured: {0}")]
    Configuration(String),

    #[error("embedding timeout")]
    Timeout,
}

impl EmbeddingError {
    /// Map an upstream HTTP status to the matching error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => EmbeddingError::RateLimited(body),
            500..=599 => EmbeddingError::ServerError { status, body },
            _ => EmbeddingError::ClientError { status, body },
        }
    }
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::ConnectionError(_)
            | EmbeddingError::Timeout
            | EmbeddingError::RateLimited(_)
            | EmbeddingError::ServerError { .. } => true,
            EmbeddingError::RequestError(e) => e.is_timeout() || e.is_connect(),
            EmbeddingError::ClientError { .. }
            | EmbeddingError::InvalidResponse(_)
            | EmbeddingError::DimensionMismatch { .. }
            | EmbeddingError::Configuration(_) => false,
        }
    }
}

/// Errors related to vector index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("pgvector extension is not installed. Run: CREATE EXTENSION vector;")]
    PgVectorMissing,

    #[error("index IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid embedding vector: {0}")]
    InvalidVector(String),

    #[error("generation not found: {0}")]
    GenerationNotFound(String),

    #[error("generation {generation_id} is {status}, expected {expected}")]
    GenerationState {
        generation_id: String,
        status: String,
        expected: &'static str,
    },

    #[error("record {record} belongs to project {record_project}, generation is for {project}")]
    ProjectMismatch {
        record: String,
        record_project: String,
        project: String,
    },

    #[error("invalid database value: {0}")]
    InvalidDbValue(String),

    #[error("index task failed: {0}")]
    TaskError(String),
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::DimensionMismatch { .. }
            | IndexError::InvalidVector(_)
            | IndexError::ProjectMismatch { .. } => ErrorKind::Validation,
            IndexError::GenerationNotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        IndexError::Postgres(e.to_string())
    }
}

/// Errors raised by the extraction pipeline and its run registry.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction already running for project {project_id} (run {run_id})")]
    Conflict { project_id: String, run_id: String },

    #[error("invalid extraction request: {0}")]
    Validation(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("no active extraction for project {0}")]
    NotRunning(String),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Conflict { .. } => ErrorKind::Conflict,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::RunNotFound(_) | PipelineError::NotRunning(_) => ErrorKind::NotFound,
            PipelineError::Index(e) => e.kind(),
            _ => ErrorKind::Internal,
        }
    }
}

/// Errors related to search operations.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("embedding error: {0}")]
    EmbeddingError(#[from] EmbeddingError),

    #[error("index error: {0}")]
    IndexError(#[from] IndexError),
}

impl SearchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SearchError::InvalidQuery(_) => ErrorKind::Validation,
            SearchError::IndexError(e) => e.kind(),
            SearchError::EmbeddingError(_) => ErrorKind::Internal,
        }
    }
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Errors related to daemon communication.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is not running")]
    NotRunning,

    #[error("failed to connect to daemon: {0}")]
    ConnectionFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("failed to spawn daemon: {0}")]
    SpawnError(String),

    #[error("timed out waiting for daemon")]
    Timeout,

    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Application-level errors that wrap domain errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("search error: {0}")]
    Search(#[from] SearchError),

    #[error("daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_status_mapping() {
        assert!(SourceError::from_status(429, String::new()).is_retryable());
        assert!(SourceError::from_status(503, String::new()).is_retryable());
        assert!(!SourceError::from_status(401, String::new()).is_retryable());
        assert!(!SourceError::from_status(404, String::new()).is_retryable());
    }

    #[test]
    fn test_embedding_status_mapping() {
        assert!(EmbeddingError::from_status(429, String::new()).is_retryable());
        assert!(EmbeddingError::from_status(500, String::new()).is_retryable());
        assert!(!EmbeddingError::from_status(400, String::new()).is_retryable());
        assert!(
            !EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_kinds() {
        let conflict = PipelineError::Conflict {
            project_id: "p".to_string(),
            run_id: "r".to_string(),
        };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert_eq!(
            SearchError::InvalidQuery("empty".to_string()).kind(),
            ErrorKind::Validation
        );
        let mismatch = IndexError::DimensionMismatch {
            expected: 4,
            actual: 3,
        };
        assert_eq!(PipelineError::Index(mismatch).kind(), ErrorKind::Validation);
    }
}
