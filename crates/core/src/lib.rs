pub mod chunking;
pub mod config;
pub mod context;
pub mod documents;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod lexical;
pub mod llm;
#[cfg(feature = "local-models")]
pub mod local_models;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod rag;
pub mod rerank;
pub mod stores;
pub mod traits;

pub use chunking::{build_chunks, chunk, normalize, ChunkingConfig};
pub use config::{LlmEndpoint, LlmSettings, RerankerSettings, RetrievalSettings};
pub use context::RequestContext;
pub use documents::{register_upload, FileDocumentStore};
pub use embeddings::{CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{
    ChatError, EmbedError, ErrorReport, IngestError, LlmError, SearchError, StoreError,
    UpstreamError,
};
pub use extractor::{guess_content_type, ContentTypeParser, DocumentParser, LopdfExtractor};
pub use ingest::{discover_files, IndexOutcome, IndexingPipeline};
pub use lexical::keyword_score;
pub use llm::{AnswerGenerator, AnswerStream, ChatBackend, OpenAiBackend};
#[cfg(feature = "local-models")]
pub use local_models::{FastEmbedReranker, FastEmbedder};
pub use models::{
    ChatAnswer, ChatMessage, Chunk, ChunkMetadata, Document, DocumentStatus, RetrievalMode,
    RetrievedChunk, VectorMatches, VectorRecord,
};
pub use orchestrator::{fused_score, RetrievalOrchestrator};
pub use queue::{IndexingQueue, QueueReport};
pub use rag::RagChat;
pub use rerank::{HttpCrossEncoder, Reranker};
pub use stores::{LocalVectorStore, QdrantStore};
pub use traits::{DocumentStore, Transition, VectorIndex};
