use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::DocumentStatus;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("vector index error: {0}")]
    Store(#[from] StoreError),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("indexing queue is closed, document {0} was not scheduled")]
    QueueClosed(Uuid),

    #[error("text pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::InvalidParameter(_) => "INVALID_PARAMETER",
            IngestError::UnsupportedContentType(_) => "UNSUPPORTED_DOCUMENT_TYPE",
            IngestError::Io(_) | IngestError::PdfParse(_) => "DOCUMENT_PARSE_FAILED",
            IngestError::Embedding(_) => "EMBEDDING_FAILED",
            IngestError::Store(error) => error.code(),
            IngestError::Task(_) | IngestError::Pattern(_) => "INTERNAL_ERROR",
            IngestError::QueueClosed(_) => "QUEUE_CLOSED",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "batch length mismatch: ids={ids} texts={texts} vectors={vectors} metadatas={metadatas}"
    )]
    LengthMismatch {
        ids: usize,
        texts: usize,
        vectors: usize,
        metadatas: usize,
    },

    #[error("vector dimension {found} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("index was built with embedding model `{expected}`, refusing vectors from `{found}`")]
    ModelMismatch { expected: String, found: String },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("document {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: Uuid,
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("document {0} already exists")]
    DuplicateDocument(Uuid),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::LengthMismatch { .. } => "LENGTH_MISMATCH",
            StoreError::DimensionMismatch { .. } | StoreError::ModelMismatch { .. } => {
                "EMBEDDING_MODEL_MISMATCH"
            }
            StoreError::IllegalTransition { .. } => "ILLEGAL_STATUS_TRANSITION",
            StoreError::DuplicateDocument(_) => "DUPLICATE_DOCUMENT",
            _ => "STORE_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("failed to load model {model}: {details}")]
    ModelLoad { model: String, details: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model returned {found} vectors for {expected} inputs")]
    CountMismatch { expected: usize, found: usize },

    #[error("unknown embedding model: {0}")]
    UnknownModel(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("unknown retrieval mode `{0}` (expected vector, hybrid or rerank)")]
    UnknownRetrievalMode(String),

    #[error("query is empty")]
    EmptyQuery,

    #[error("top_k must be a positive integer, got {0}")]
    InvalidTopK(usize),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("vector index error: {0}")]
    Store(#[from] StoreError),

    #[error("rerank mode requires a configured cross-encoder")]
    RerankerMissing,

    #[error("reranker failed: {0}")]
    Rerank(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("text pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),
}

impl SearchError {
    pub fn code(&self) -> &'static str {
        match self {
            SearchError::UnknownRetrievalMode(_) => "UNKNOWN_RETRIEVAL_MODE",
            SearchError::EmptyQuery => "EMPTY_QUERY",
            SearchError::InvalidTopK(_) => "INVALID_TOP_K",
            SearchError::Embedding(_) => "EMBEDDING_FAILED",
            SearchError::Store(error) => error.code(),
            SearchError::RerankerMissing => "RERANKER_NOT_CONFIGURED",
            SearchError::Rerank(_) | SearchError::Http(_) => "RERANK_FAILED",
            SearchError::Task(_) | SearchError::Pattern(_) => "INTERNAL_ERROR",
        }
    }
}

/// Transport-level cause of a failed language-model call.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("language model is not configured: {0}")]
    Configuration(String),

    #[error("language model call failed after {attempts} attempt(s): {source}")]
    Upstream {
        attempts: u32,
        #[source]
        source: UpstreamError,
    },
}

impl LlmError {
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::Configuration(_) => "LLM_CONFIGURATION_ERROR",
            LlmError::Upstream { .. } => "LLM_UPSTREAM_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Search(error) => error.code(),
            ChatError::Llm(error) => error.code(),
        }
    }
}

/// Caller-facing rendering of a failure: a stable code plus a readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub message: String,
}

macro_rules! impl_report {
    ($($error:ty),+ $(,)?) => {
        $(
            impl From<&$error> for ErrorReport {
                fn from(error: &$error) -> Self {
                    ErrorReport {
                        code: error.code(),
                        message: error.to_string(),
                    }
                }
            }
        )+
    };
}

impl_report!(IngestError, StoreError, SearchError, LlmError, ChatError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_for_the_caller_facing_taxonomy() {
        assert_eq!(
            IngestError::InvalidParameter("size".into()).code(),
            "INVALID_PARAMETER"
        );
        assert_eq!(
            IngestError::UnsupportedContentType("image/png".into()).code(),
            "UNSUPPORTED_DOCUMENT_TYPE"
        );
        assert_eq!(
            StoreError::LengthMismatch {
                ids: 1,
                texts: 2,
                vectors: 2,
                metadatas: 2
            }
            .code(),
            "LENGTH_MISMATCH"
        );
        assert_eq!(
            LlmError::Configuration("missing key".into()).code(),
            "LLM_CONFIGURATION_ERROR"
        );
        assert_eq!(
            LlmError::Upstream {
                attempts: 4,
                source: UpstreamError::Timeout(Duration::from_secs(1)),
            }
            .code(),
            "LLM_UPSTREAM_ERROR"
        );
        assert_eq!(
            SearchError::UnknownRetrievalMode("bm25".into()).code(),
            "UNKNOWN_RETRIEVAL_MODE"
        );
    }

    #[test]
    fn pattern_failures_are_internal_errors() {
        let cause = regex::Regex::new("(").unwrap_err();
        assert_eq!(IngestError::from(cause.clone()).code(), "INTERNAL_ERROR");
        assert_eq!(SearchError::from(cause).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn report_carries_code_and_message() {
        let error = ChatError::from(SearchError::EmptyQuery);
        let report = ErrorReport::from(&error);
        assert_eq!(report.code, "EMPTY_QUERY");
        assert_eq!(report.message, "query is empty");
    }
}
