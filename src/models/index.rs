//! Generation bookkeeping and index statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an index generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Being written; invisible to queries.
    Building,
    /// The one generation per project that queries see.
    Active,
    /// Replaced by a newer active generation; awaiting retirement.
    Superseded,
    /// Rows deleted.
    Retired,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Building => "building",
            GenerationStatus::Active => "active",
            GenerationStatus::Superseded => "superseded",
            GenerationStatus::Retired => "retired",
        }
    }
}

impl std::str::FromStr for GenerationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(GenerationStatus::Building),
            "active" => Ok(GenerationStatus::Active),
            "superseded" => Ok(GenerationStatus::Superseded),
            "retired" => Ok(GenerationStatus::Retired),
            _ => Err(format!("unknown generation status: {}", s)),
        }
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered generation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub generation_id: String,
    pub project_id: String,
    pub status: GenerationStatus,
    pub record_count: u64,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Optional narrowing of a similarity query.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub project_id: Option<String>,
    pub min_score: Option<f32>,
}

/// Collection-level statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub collection: String,
    /// Records visible to queries (active generations only).
    pub total_records: u64,
    pub dimension: usize,
    pub active_generations: u64,
    pub last_updated: Option<DateTime<Utc>>,
}
