use crate::{ChunkMetadata, Document, DocumentStatus, StoreError, VectorMatches};
use async_trait::async_trait;
use uuid::Uuid;

/// Durable nearest-neighbour store of chunk vectors.
///
/// Distances follow the "smaller is closer" convention. Callers convert them
/// to similarities before fusing with other signals.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Binds the index to one embedding space, or checks that it already is.
    async fn ensure_model(&self, model_id: &str, dimensions: usize) -> Result<(), StoreError>;

    async fn upsert(
        &self,
        ids: &[String],
        texts: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
    ) -> Result<(), StoreError>;

    async fn search(&self, query_vector: &[f32], k: usize) -> Result<VectorMatches, StoreError>;

    /// Removes every record tagged with `document_id`, returning how many went.
    async fn delete_document(&self, document_id: Uuid) -> Result<usize, StoreError>;
}

pub(crate) fn check_batch_lengths(
    ids: &[String],
    texts: &[String],
    vectors: &[Vec<f32>],
    metadatas: &[ChunkMetadata],
) -> Result<(), StoreError> {
    let expected = ids.len();
    if texts.len() != expected || vectors.len() != expected || metadatas.len() != expected {
        return Err(StoreError::LengthMismatch {
            ids: ids.len(),
            texts: texts.len(),
            vectors: vectors.len(),
            metadatas: metadatas.len(),
        });
    }
    Ok(())
}

/// Outcome of a compare-and-set status commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Document),
    /// The row no longer exists.
    Missing,
    /// Another writer moved the row first.
    Rejected { current: DocumentStatus },
}

/// Persistent rows describing uploaded documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, document: Document) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Document>, StoreError>;

    /// Newest first, optionally restricted to one owner.
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<Document>, StoreError>;

    /// Moves `id` from `from` to `to` if it is still in `from`.
    ///
    /// Pairs outside the lifecycle fail with `IllegalTransition` without
    /// touching the row.
    async fn transition(
        &self,
        id: Uuid,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> Result<Transition, StoreError>;

    /// Puts a finished (`Done` or `Failed`) document back to `Pending`.
    async fn reset_for_reindex(&self, id: Uuid) -> Result<Transition, StoreError>;
}
