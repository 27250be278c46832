use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::embedding::Embedder;
use super::index::VectorIndex;
use crate::error::SearchError;
use crate::models::{QueryFilter, SearchConfig, SearchQuery, SearchResults};

/// Embeds a free-text query and ranks active column records against it.
#[derive(Clone)]
pub struct SearchService {
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(embedder: Embedder, index: Arc<dyn VectorIndex>, config: SearchConfig) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    /// Resolve and bound-check `top_k`.
    pub fn resolve_top_k(&self, query: &SearchQuery) -> Result<usize, SearchError> {
        let top_k = query.top_k.unwrap_or(self.config.default_top_k);
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(SearchError::InvalidQuery(format!(
                "top_k must be between 1 and {}, got {}",
                self.config.max_top_k, top_k
            )));
        }
        Ok(top_k as usize)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults, SearchError> {
        let start = Instant::now();

        let text = query.query.trim();
        if text.is_empty() {
            return Err(SearchError::InvalidQuery("query must not be empty".to_string()));
        }
        let top_k = self.resolve_top_k(query)?;

        let vector = self.embedder.embed_query(text).await?;
        let filter = QueryFilter {
            project_id: query.project_id.clone(),
            min_score: query.min_score.or(self.config.default_min_score),
        };
        let hits = self.index.query(&vector, top_k, &filter).await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            query = text,
            top_k,
            hits = hits.len(),
            duration_ms,
            "search completed"
        );

        Ok(SearchResults::new(text.to_string(), hits, duration_ms))
    }
}
