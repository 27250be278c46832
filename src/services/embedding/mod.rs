//! Embedding providers and the batching/retrying front end used by the
//! pipeline and the search service.

mod openai;
mod tei;

pub use openai::OpenAiProvider;
pub use tei::{HealthResponse, TeiProvider};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::EmbeddingError;
use crate::models::{EmbeddingConfig, EmbeddingProviderKind};
use crate::utils::{RetryConfig, retry};

/// A remote model that turns texts into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Largest number of inputs accepted by one request.
    fn max_batch_size(&self) -> usize;

    /// Embed one request-sized batch, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn health_check(&self) -> Result<bool, EmbeddingError> {
        Ok(true)
    }
}

pub(crate) fn map_send_error(e: reqwest::Error) -> EmbeddingError {
    if e.is_timeout() {
        EmbeddingError::Timeout
    } else if e.is_connect() {
        EmbeddingError::ConnectionError(e.to_string())
    } else {
        EmbeddingError::RequestError(e)
    }
}

/// Build the provider selected in configuration.
pub fn create_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match config.provider {
        EmbeddingProviderKind::OpenAi => Ok(Arc::new(OpenAiProvider::new(config)?)),
        EmbeddingProviderKind::Tei => Ok(Arc::new(TeiProvider::new(config)?)),
    }
}

/// Splits inputs into provider-sized batches, retries transient failures and
/// validates every response against the configured dimension.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    dimension: usize,
    retry: RetryConfig,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, dimension: usize, retry: RetryConfig) -> Self {
        Self {
            provider,
            dimension,
            retry,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        Ok(Self::new(
            create_provider(config)?,
            config.dimension,
            config.retry.to_retry_config(),
        ))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// One vector per input, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.provider.max_batch_size().max(1);
        let mut vectors = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(batch_size) {
            debug!(
                provider = self.provider.name(),
                inputs = chunk.len(),
                "embedding batch"
            );
            let batch = retry(&self.retry, || self.provider.embed_batch(chunk)).await?;
            validate_batch(&batch, chunk.len(), self.dimension)?;
            vectors.extend(batch);
        }

        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding response".to_string()))
    }
}

fn validate_batch(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dimension: usize,
) -> Result<(), EmbeddingError> {
    if vectors.len() != expected_count {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected_count,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Echoes the input length into a one-hot-ish vector and can fail on demand.
    struct ScriptedProvider {
        batch_size: usize,
        dimension: usize,
        failures_left: AtomicU32,
        failure: fn() -> EmbeddingError,
        calls: Mutex<Vec<usize>>,
    }

    impl ScriptedProvider {
        fn new(batch_size: usize, dimension: usize) -> Self {
            Self {
                batch_size,
                dimension,
                failures_left: AtomicU32::new(0),
                failure: || EmbeddingError::RateLimited("slow down".to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(mut self, times: u32, failure: fn() -> EmbeddingError) -> Self {
            self.failures_left = AtomicU32::new(times);
            self.failure = failure;
            self
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-model"
        }

        fn max_batch_size(&self) -> usize {
            self.batch_size
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.lock().unwrap().push(texts.len());
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err((self.failure)());
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dimension];
                    v[t.len() % self.dimension] = 1.0;
                    v
                })
                .collect())
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(0.0)
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn test_splits_into_provider_batches() {
        let provider = Arc::new(ScriptedProvider::new(4, 8));
        let embedder = Embedder::new(provider.clone(), 8, fast_retry());

        let vectors = embedder.embed(&texts(10)).await.unwrap();
        assert_eq!(vectors.len(), 10);
        assert_eq!(*provider.calls.lock().unwrap(), vec![4, 4, 2]);
        // order preserved: text i has length i + 1
        assert_eq!(vectors[2][3], 1.0);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let provider = Arc::new(
            ScriptedProvider::new(8, 4)
                .failing(2, || EmbeddingError::ServerError {
                    status: 503,
                    body: String::new(),
                }),
        );
        let embedder = Embedder::new(provider.clone(), 4, fast_retry());

        let vectors = embedder.embed(&texts(3)).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(provider.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_error() {
        let provider = Arc::new(ScriptedProvider::new(8, 4).failing(10, || {
            EmbeddingError::RateLimited("quota".to_string())
        }));
        let embedder = Embedder::new(provider.clone(), 4, fast_retry());

        let result = embedder.embed(&texts(2)).await;
        assert!(matches!(result, Err(EmbeddingError::RateLimited(_))));
        assert_eq!(provider.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(8, 4).failing(1, || {
            EmbeddingError::ClientError {
                status: 400,
                body: "bad input".to_string(),
            }
        }));
        let embedder = Embedder::new(provider.clone(), 4, fast_retry());

        assert!(embedder.embed(&texts(1)).await.is_err());
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let provider = Arc::new(ScriptedProvider::new(8, 4));
        let embedder = Embedder::new(provider, 6, fast_retry());

        let result = embedder.embed_query("customer email").await;
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch {
                expected: 6,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let provider = Arc::new(ScriptedProvider::new(8, 4));
        let embedder = Embedder::new(provider.clone(), 4, fast_retry());

        assert!(embedder.embed(&[]).await.unwrap().is_empty());
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_validate_batch_count() {
        let result = validate_batch(&[vec![0.0; 3]], 2, 3);
        assert!(matches!(result, Err(EmbeddingError::InvalidResponse(_))));
    }

    #[test]
    fn test_create_provider_tei() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderKind::Tei,
            url: "http://localhost:8080".to_string(),
            ..Default::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "tei");
    }
}
