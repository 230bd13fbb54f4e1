use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SearchError;

/// Indexing lifecycle of an uploaded document.
///
/// `Pending -> Processing -> Done | Failed`. `Done` and `Failed` are terminal
/// for the pipeline; only an external re-trigger moves them back to `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Done | DocumentStatus::Failed)
    }

    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Pending, DocumentStatus::Processing)
                | (DocumentStatus::Processing, DocumentStatus::Done)
                | (DocumentStatus::Processing, DocumentStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Done => "DONE",
            DocumentStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub user_id: String,
    pub filename: String,
    pub file_path: PathBuf,
    pub content_type: String,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn pending(
        user_id: impl Into<String>,
        filename: impl Into<String>,
        file_path: impl Into<PathBuf>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            filename: filename.into(),
            file_path: file_path.into(),
            content_type: content_type.into(),
            status: DocumentStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// A bounded slice of a document's normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub document_id: Uuid,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkMetadata {
    pub document_id: Uuid,
    pub chunk_index: usize,
}

/// A chunk as stored by a vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Position-aligned result of a nearest-neighbour search, best match first.
/// Smaller distance means more similar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorMatches {
    pub texts: Vec<String>,
    pub metadatas: Vec<ChunkMetadata>,
    pub distances: Vec<f64>,
}

impl VectorMatches {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn into_chunks(self) -> Vec<RetrievedChunk> {
        self.texts
            .into_iter()
            .zip(self.metadatas)
            .zip(self.distances)
            .map(|((text, metadata), distance)| RetrievedChunk {
                text,
                document_id: metadata.document_id,
                chunk_index: metadata.chunk_index,
                score: distance,
                keyword_score: None,
                final_score: None,
                rerank_score: None,
            })
            .collect()
    }
}

/// A passage produced by one retrieval call. `score` is the raw index distance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub text: String,
    pub document_id: Uuid,
    pub chunk_index: usize,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Vector,
    #[default]
    Hybrid,
    Rerank,
}

impl RetrievalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalMode::Vector => "vector",
            RetrievalMode::Hybrid => "hybrid",
            RetrievalMode::Rerank => "rerank",
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = SearchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(RetrievalMode::Vector),
            "hybrid" => Ok(RetrievalMode::Hybrid),
            "rerank" => Ok(RetrievalMode::Rerank),
            _ => Err(SearchError::UnknownRetrievalMode(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub question: String,
    pub answer: String,
    pub chunks: Vec<RetrievedChunk>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_only_moves_forward() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Done));
        assert!(!Done.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Done));
        assert!(!Done.can_transition_to(Pending));
    }

    #[test]
    fn status_serializes_in_upper_case() {
        let json = serde_json::to_value(DocumentStatus::Processing).unwrap();
        assert_eq!(json, "PROCESSING");
    }

    #[test]
    fn retrieval_mode_parses_known_names_only() {
        assert_eq!("Rerank".parse::<RetrievalMode>().unwrap(), RetrievalMode::Rerank);
        assert_eq!(" vector ".parse::<RetrievalMode>().unwrap(), RetrievalMode::Vector);
        let error = "bm25".parse::<RetrievalMode>().unwrap_err();
        assert!(matches!(error, SearchError::UnknownRetrievalMode(mode) if mode == "bm25"));
    }

    #[test]
    fn matches_convert_to_chunks_in_order() {
        let document_id = Uuid::new_v4();
        let matches = VectorMatches {
            texts: vec!["first".into(), "second".into()],
            metadatas: vec![
                ChunkMetadata {
                    document_id,
                    chunk_index: 3,
                },
                ChunkMetadata {
                    document_id,
                    chunk_index: 0,
                },
            ],
            distances: vec![0.1, 0.4],
        };

        let chunks = matches.into_chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "first");
        assert_eq!(chunks[0].chunk_index, 3);
        assert_eq!(chunks[1].score, 0.4);
        assert!(chunks[1].keyword_score.is_none());
    }
}
