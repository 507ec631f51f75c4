//! Code-aware retrieval: grammar-driven fragment extraction, incremental
//! indexing with exact vector search, and LLM-curated context assembly.

pub mod cache;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod fragment;
pub mod indexer;
pub mod languages;
pub mod registry;
pub mod render;
pub mod rerank;
pub mod retriever;
pub mod snapshot;
pub mod store;
pub mod summarizer;
pub mod synthesis;
pub mod vector_index;

pub use cache::{BestEffortCache, CacheConfig, ResultCache};
pub use error::{IndexError, Result};
pub use fragment::{Fragment, FragmentLevel, FragmentMetadata};
pub use indexer::{CodeIndexer, IndexReport, IndexerConfig};
pub use retriever::{
    AnswerOrigin, ContextAnswer, ContextRetriever, QueryOptions, RetrievalConfig, RetrievalOutcome,
};
pub use snapshot::{IndexSnapshot, SnapshotMeta};
