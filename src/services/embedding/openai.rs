//! OpenAI-compatible `/embeddings` provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{EmbeddingProvider, map_send_error};
use crate::error::EmbeddingError;
use crate::models::EmbeddingConfig;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

pub struct OpenAiProvider {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    batch_size: usize,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                EmbeddingError::Configuration(
                    "missing OpenAI API key (set OPENAI_API_KEY or embedding.api_key)".to_string(),
                )
            })?;
        if config.model.trim().is_empty() {
            return Err(EmbeddingError::Configuration(
                "missing embedding model name".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| EmbeddingError::Configuration("invalid OpenAI API key".to_string()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| EmbeddingError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.url.trim_end_matches('/')),
            model: config.model.clone(),
            dimensions: config.send_dimensions.then_some(config.dimension),
            batch_size: config.batch_size.max(1) as usize,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Restore input order and check that every input got a vector.
fn into_vectors(
    mut response: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    response.data.sort_by_key(|entry| entry.index);
    if response.data.len() != expected {
        return Err(EmbeddingError::InvalidResponse(format!(
            "provider returned {} embeddings for {} inputs",
            response.data.len(),
            expected
        )));
    }
    if let Some((pos, entry)) = response
        .data
        .iter()
        .enumerate()
        .find(|(pos, entry)| entry.index != *pos)
    {
        return Err(EmbeddingError::InvalidResponse(format!(
            "embedding index {} at position {}",
            entry.index, pos
        )));
    }
    Ok(response
        .data
        .into_iter()
        .map(|entry| entry.embedding)
        .collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::from_status(status.as_u16(), body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        into_vectors(parsed, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key() -> EmbeddingConfig {
        EmbeddingConfig {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_api_key() {
        let result = OpenAiProvider::new(&EmbeddingConfig::default());
        assert!(matches!(result, Err(EmbeddingError::Configuration(_))));

        let blank = EmbeddingConfig {
            api_key: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(OpenAiProvider::new(&blank).is_err());
    }

    #[test]
    fn test_endpoint_and_dimensions() {
        let provider = OpenAiProvider::new(&config_with_key()).unwrap();
        assert_eq!(provider.endpoint(), "https://api.openai.com/v1/embeddings");
        assert_eq!(provider.model(), "text-embedding-3-large");
        assert!(provider.dimensions.is_none());

        let shortened = EmbeddingConfig {
            send_dimensions: true,
            dimension: 256,
            ..config_with_key()
        };
        let provider = OpenAiProvider::new(&shortened).unwrap();
        assert_eq!(provider.dimensions, Some(256));
    }

    #[test]
    fn test_request_omits_absent_dimensions() {
        let input = vec!["hello".to_string()];
        let body = serde_json::to_value(EmbeddingRequest {
            model: "m",
            input: &input,
            dimensions: None,
        })
        .unwrap();
        assert!(body.get("dimensions").is_none());
        assert_eq!(body["input"][0], "hello");
    }

    #[test]
    fn test_response_reordered_by_index() {
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{"object": "list", "data": [
                {"object": "embedding", "index": 1, "embedding": [0.0, 1.0]},
                {"object": "embedding", "index": 0, "embedding": [1.0, 0.0]}
            ], "model": "text-embedding-3-large"}"#,
        )
        .unwrap();
        let vectors = into_vectors(response, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_response_count_mismatch() {
        let response: EmbeddingResponse =
            serde_json::from_str(r#"{"data": [{"index": 0, "embedding": [1.0]}]}"#).unwrap();
        assert!(matches!(
            into_vectors(response, 2),
            Err(EmbeddingError::InvalidResponse(_))
        ));
    }
}
