//! Search-related models for queries and results.

use serde::{Deserialize, Serialize};

use super::column::{ColumnIdentity, ColumnRecord};

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// Machine-parseable JSON format
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// A similarity search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Natural language query text
    pub query: String,

    /// Maximum results to return; the configured default applies when absent
    #[serde(default)]
    pub top_k: Option<u32>,

    /// Restrict results to one project
    #[serde(default)]
    pub project_id: Option<String>,

    /// Minimum similarity threshold
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl SearchQuery {
    /// Create a new search query with the given text.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: None,
            project_id: None,
            min_score: None,
        }
    }

    /// Set the result limit.
    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Restrict to a project.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Set the minimum score threshold.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// A single ranked column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub identity: ColumnIdentity,

    /// Cosine similarity (1.0 = identical direction)
    pub score: f32,

    pub record: ColumnRecord,
}

/// Collection of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    /// Query that was executed
    pub query: String,

    /// Matching results, best first
    pub results: Vec<SearchHit>,

    /// Number of results returned
    pub total: u64,

    /// Query execution time in milliseconds
    pub duration_ms: u64,
}

impl SearchResults {
    /// Create a new search results container.
    pub fn new(query: String, results: Vec<SearchHit>, duration_ms: u64) -> Self {
        let total = results.len() as u64;
        Self {
            query,
            results,
            total,
            duration_ms,
        }
    }

    /// Check if there are no results.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Get the number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }
}
