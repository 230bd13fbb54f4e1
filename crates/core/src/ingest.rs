use crate::embeddings::embed_blocking;
use crate::extractor::{guess_content_type, DocumentParser, OCTET_STREAM};
use crate::traits::{DocumentStore, Transition, VectorIndex};
use crate::{
    build_chunks, ChunkMetadata, ChunkingConfig, Document, DocumentStatus, Embedder, IngestError,
    RequestContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;
use walkdir::WalkDir;

/// Files under `folder` (recursively) whose extension maps to a parseable
/// content type, in path order.
pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if guess_content_type(entry.path()) != OCTET_STREAM {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// How one `index` run ended. Failures are reported here and in the logs,
/// never as an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    Indexed { chunks: usize },
    Failed { code: &'static str, reason: String },
    /// The row did not exist or vanished mid-run.
    Missing,
    /// Another run owns the document, or it already finished.
    Skipped { status: DocumentStatus },
}

/// Parse, chunk, embed and store one document, driving its status from
/// `Pending` to `Done` or `Failed`.
pub struct IndexingPipeline {
    documents: Arc<dyn DocumentStore>,
    parser: Arc<dyn DocumentParser>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunking: ChunkingConfig,
}

impl IndexingPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        parser: Arc<dyn DocumentParser>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        chunking: ChunkingConfig,
    ) -> Result<Self, IngestError> {
        chunking.validate()?;
        Ok(Self {
            documents,
            parser,
            embedder,
            index,
            chunking,
        })
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub async fn index(&self, ctx: &RequestContext, document_id: Uuid) -> IndexOutcome {
        let span = tracing::info_span!(
            "index_document",
            trace_id = %ctx.trace_id,
            document_id = %document_id
        );
        self.run(document_id).instrument(span).await
    }

    async fn run(&self, document_id: Uuid) -> IndexOutcome {
        let claimed = self
            .documents
            .transition(document_id, DocumentStatus::Pending, DocumentStatus::Processing)
            .await;

        let document = match claimed {
            Ok(Transition::Applied(document)) => document,
            Ok(Transition::Missing) => {
                tracing::debug!("document row not found, nothing to index");
                return IndexOutcome::Missing;
            }
            Ok(Transition::Rejected { current }) => {
                tracing::info!(status = %current, "document is not pending, skipping");
                return IndexOutcome::Skipped { status: current };
            }
            Err(error) => {
                tracing::error!(error = %error, "could not claim document");
                let error = IngestError::from(error);
                return IndexOutcome::Failed {
                    code: error.code(),
                    reason: error.to_string(),
                };
            }
        };

        match self.process(&document).await {
            Ok(Some(chunks)) => match self.finish(document_id, DocumentStatus::Done).await {
                None => {
                    tracing::info!(chunks, "document indexed");
                    IndexOutcome::Indexed { chunks }
                }
                // Done could not be committed; the row must still leave Processing.
                Some(failed @ IndexOutcome::Failed { .. }) => self
                    .finish(document_id, DocumentStatus::Failed)
                    .await
                    .unwrap_or(failed),
                Some(outcome) => outcome,
            },
            Ok(None) => {
                tracing::debug!("document vanished during indexing");
                IndexOutcome::Missing
            }
            Err(error) => {
                tracing::error!(
                    code = error.code(),
                    error = %error,
                    filename = %document.filename,
                    "indexing failed"
                );
                let failed = IndexOutcome::Failed {
                    code: error.code(),
                    reason: error.to_string(),
                };
                self.finish(document_id, DocumentStatus::Failed)
                    .await
                    .unwrap_or(failed)
            }
        }
    }

    /// Commits the terminal status. `None` means it was applied.
    async fn finish(&self, document_id: Uuid, status: DocumentStatus) -> Option<IndexOutcome> {
        match self
            .documents
            .transition(document_id, DocumentStatus::Processing, status)
            .await
        {
            Ok(Transition::Applied(_)) => None,
            Ok(Transition::Missing) => {
                tracing::debug!("document vanished before its final status");
                Some(IndexOutcome::Missing)
            }
            Ok(Transition::Rejected { current }) => {
                tracing::warn!(status = %current, "document status changed underneath the pipeline");
                Some(IndexOutcome::Skipped { status: current })
            }
            Err(error) => {
                tracing::error!(error = %error, target_status = %status, "could not commit final status");
                let error = IngestError::from(error);
                Some(IndexOutcome::Failed {
                    code: error.code(),
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Runs every stage. `Ok(None)` means the row disappeared before the
    /// vectors were written.
    async fn process(&self, document: &Document) -> Result<Option<usize>, IngestError> {
        let parser = self.parser.clone();
        let path = document.file_path.clone();
        let content_type = document.content_type.clone();
        let raw_text = tokio::task::spawn_blocking(move || parser.parse(&path, &content_type))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))??;

        let chunks = build_chunks(document.id, &raw_text, self.chunking)?;
        tracing::debug!(chars = raw_text.chars().count(), chunks = chunks.len(), "chunked document");
        if chunks.is_empty() {
            tracing::warn!("document produced no chunks");
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = embed_blocking(self.embedder.clone(), texts.clone()).await?;

        if self.documents.get(document.id).await?.is_none() {
            return Ok(None);
        }

        self.index
            .ensure_model(self.embedder.model_id(), self.embedder.dimensions())
            .await?;

        let ids: Vec<String> = chunks.iter().map(|_| Uuid::new_v4().to_string()).collect();
        let metadatas: Vec<ChunkMetadata> = chunks
            .iter()
            .map(|chunk| ChunkMetadata {
                document_id: chunk.document_id,
                chunk_index: chunk.chunk_index,
            })
            .collect();

        let removed = self.index.delete_document(document.id).await?;
        if removed > 0 {
            tracing::info!(removed, "replaced records from a previous run");
        }
        self.index.upsert(&ids, &texts, &vectors, &metadatas).await?;

        Ok(Some(chunks.len()))
    }
}
