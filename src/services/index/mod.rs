//! Generation-aware vector index.
//!
//! Records are written into a `building` generation that queries never see.
//! Publishing flips it to `active` and supersedes the project's previous
//! generation in one transaction; superseded rows are deleted afterwards by
//! `retire_generation`.

mod pgvector;
mod sqlite;

pub use pgvector::PgVectorIndex;
pub use sqlite::SqliteIndex;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::IndexError;
use crate::models::{
    ColumnIdentity, ColumnRecord, Config, Generation, IndexDriver, IndexStats, QueryFilter,
    SearchHit,
};

/// A column record and its embedding.
pub type EmbeddedRecord = (ColumnRecord, Vec<f32>);

/// Stored `(content_hash, vector)` per identity of one generation.
pub type GenerationHashes = HashMap<ColumnIdentity, (String, Vec<f32>)>;

/// What `recover` cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Building generations discarded.
    pub aborted: u64,
    /// Superseded generations whose rows were deleted.
    pub retired: u64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn collection(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn health_check(&self) -> Result<bool, IndexError>;

    /// Register a `building` generation for a project.
    async fn begin_generation(&self, project_id: &str, generation_id: &str)
    -> Result<(), IndexError>;

    /// Stage records into a building generation in one transaction.
    /// Returns the generation's record count afterwards.
    async fn append(
        &self,
        generation_id: &str,
        records: Vec<EmbeddedRecord>,
    ) -> Result<u64, IndexError>;

    /// Make a building generation active. Returns the generation it replaced.
    async fn publish(&self, generation_id: &str) -> Result<Option<String>, IndexError>;

    /// Discard a building generation and its rows.
    async fn abort_generation(&self, generation_id: &str) -> Result<(), IndexError>;

    /// Delete the rows of a superseded generation. Refuses active ones.
    /// Returns the number of rows removed.
    async fn retire_generation(&self, generation_id: &str) -> Result<u64, IndexError>;

    /// Rank records of active generations by cosine similarity.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<SearchHit>, IndexError>;

    async fn generation(&self, generation_id: &str) -> Result<Option<Generation>, IndexError>;

    async fn active_generation(&self, project_id: &str) -> Result<Option<Generation>, IndexError>;

    async fn generation_hashes(&self, generation_id: &str)
    -> Result<GenerationHashes, IndexError>;

    async fn stats(&self) -> Result<IndexStats, IndexError>;

    /// Discard building generations and finish retiring superseded ones.
    async fn recover(&self) -> Result<RecoveryReport, IndexError>;

    /// Begin, append and publish one generation; nothing is visible unless
    /// every step succeeds.
    async fn upsert(
        &self,
        project_id: &str,
        generation_id: &str,
        records: Vec<EmbeddedRecord>,
    ) -> Result<Option<String>, IndexError> {
        self.begin_generation(project_id, generation_id).await?;

        let staged = match self.append(generation_id, records).await {
            Ok(_) => self.publish(generation_id).await,
            Err(e) => Err(e),
        };

        if staged.is_err() {
            self.abort_generation(generation_id).await.ok();
        }
        staged
    }
}

/// Build the configured backend, then clean up after any interrupted run.
pub async fn create_index(
    config: &Config,
    dimension: usize,
) -> Result<Arc<dyn VectorIndex>, IndexError> {
    let index: Arc<dyn VectorIndex> = match config.index.driver {
        IndexDriver::Sqlite => {
            let path = config.index_path();
            let collection = config.index.collection.clone();
            let index = tokio::task::spawn_blocking(move || {
                SqliteIndex::open(&path, &collection, dimension)
            })
            .await
            .map_err(|e| IndexError::TaskError(e.to_string()))??;
            Arc::new(index)
        }
        IndexDriver::PgVector => Arc::new(PgVectorIndex::new(&config.index, dimension).await?),
    };

    let report = index.recover().await?;
    if report != RecoveryReport::default() {
        info!(
            aborted = report.aborted,
            retired = report.retired,
            "recovered index generations"
        );
    }
    Ok(index)
}

/// Reject vectors the index cannot store.
pub fn validate_vector(vector: &[f32], dimension: usize) -> Result<(), IndexError> {
    if vector.len() != dimension {
        return Err(IndexError::DimensionMismatch {
            expected: dimension,
            actual: vector.len(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(IndexError::InvalidVector(
            "vector contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_vector(blob: &[u8], dimension: usize) -> Result<Vec<f32>, IndexError> {
    let expected_len = dimension * std::mem::size_of::<f32>();
    if blob.len() != expected_len {
        return Err(IndexError::InvalidDbValue(format!(
            "invalid embedding byte length: expected {expected_len}, got {}",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Cosine similarity; `None` for empty, mismatched or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let x64 = f64::from(x);
        let y64 = f64::from(y);
        dot += x64 * y64;
        norm_a += x64 * x64;
        norm_b += y64 * y64;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some(dot / denom)
}

/// Best score first, identity order on ties, at most `top_k`.
pub fn rank_hits(mut hits: Vec<SearchHit>, top_k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.identity.cmp(&b.identity))
    });
    hits.truncate(top_k);
    hits
}
