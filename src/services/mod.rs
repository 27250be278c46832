pub mod embedding;
pub mod index;
mod pipeline;
mod search;

pub use embedding::{Embedder, EmbeddingProvider, create_provider};
pub use index::{VectorIndex, create_index};
pub use pipeline::{ExtractionPipeline, PipelineSettings, RunRegistry};
pub use search::SearchService;
