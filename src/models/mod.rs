mod column;
mod config;
mod index;
mod run;
mod search;

pub use column::{ColumnIdentity, ColumnMode, ColumnRecord, DatasetRef, TableRef};
pub use config::{
    BatchErrorPolicy, CatalogConfig, CatalogDriver, Config, DEFAULT_BIGQUERY_URL,
    DEFAULT_COLLECTION, DEFAULT_EMBEDDING_DIMENSION, DEFAULT_EMBEDDING_MODEL, DEFAULT_MAX_TOP_K,
    DEFAULT_OPENAI_URL, DaemonConfig, EmbeddingConfig, EmbeddingProviderKind, ExtractionConfig,
    IndexConfig, IndexDriver, RetrySettings, SearchConfig,
};
pub use index::{Generation, GenerationStatus, IndexStats, QueryFilter};
pub use run::{ExtractRequest, ExtractionRun, RunStatus};
pub use search::{OutputFormat, SearchHit, SearchQuery, SearchResults};
