use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::extractor::guess_content_type;
use crate::stores::write_json_atomic;
use crate::traits::{DocumentStore, Transition};
use crate::{Document, DocumentStatus, IngestError, StoreError};

type Rows = BTreeMap<Uuid, Document>;

/// Document rows kept in memory and mirrored to a JSON file on every commit.
/// A change becomes visible only after it has been written to disk.
pub struct FileDocumentStore {
    rows: RwLock<Rows>,
    writer: tokio::sync::Mutex<()>,
    persist_path: Option<PathBuf>,
}

impl FileDocumentStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let rows = if path.exists() {
            let data = std::fs::read(&path)?;
            let documents: Vec<Document> = serde_json::from_slice(&data)?;
            documents
                .into_iter()
                .map(|document| (document.id, document))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            rows: RwLock::new(rows),
            writer: tokio::sync::Mutex::new(()),
            persist_path: Some(path),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            writer: tokio::sync::Mutex::new(()),
            persist_path: None,
        }
    }

    /// Runs `change` against a copy of the rows. When it reports a write,
    /// the copy is persisted and only then replaces the live rows; a failed
    /// write leaves both memory and disk as they were.
    async fn apply<T>(
        &self,
        change: impl FnOnce(&mut Rows) -> Result<(T, bool), StoreError>,
    ) -> Result<T, StoreError> {
        let _writer = self.writer.lock().await;
        let mut staged = self.rows.read().clone();
        let (result, dirty) = change(&mut staged)?;
        if !dirty {
            return Ok(result);
        }

        if let Some(path) = &self.persist_path {
            let documents: Vec<Document> = staged.values().cloned().collect();
            write_json_atomic(path.clone(), documents).await?;
        }
        *self.rows.write() = staged;
        Ok(result)
    }

    async fn commit(
        &self,
        id: Uuid,
        accept: impl FnOnce(DocumentStatus) -> bool,
        to: DocumentStatus,
    ) -> Result<Transition, StoreError> {
        self.apply(|rows| {
            let Some(row) = rows.get_mut(&id) else {
                return Ok((Transition::Missing, false));
            };
            if !accept(row.status) {
                return Ok((Transition::Rejected { current: row.status }, false));
            }
            row.status = to;
            Ok((Transition::Applied(row.clone()), true))
        })
        .await
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn insert(&self, document: Document) -> Result<(), StoreError> {
        self.apply(|rows| {
            if rows.contains_key(&document.id) {
                return Err(StoreError::DuplicateDocument(document.id));
            }
            rows.insert(document.id, document);
            Ok(((), true))
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>, StoreError> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<Document>, StoreError> {
        let mut documents: Vec<Document> = self
            .rows
            .read()
            .values()
            .filter(|document| user_id.map_or(true, |owner| document.user_id == owner))
            .cloned()
            .collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(documents)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> Result<Transition, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { id, from, to });
        }
        self.commit(id, |current| current == from, to).await
    }

    async fn reset_for_reindex(&self, id: Uuid) -> Result<Transition, StoreError> {
        self.commit(id, DocumentStatus::is_terminal, DocumentStatus::Pending)
            .await
    }
}

/// Copies `source` into `uploads_dir` under a fresh id and records a
/// `Pending` row for it. The caller schedules indexing afterwards.
pub async fn register_upload(
    store: &dyn DocumentStore,
    uploads_dir: &Path,
    source: &Path,
    user_id: &str,
    content_type: Option<&str>,
) -> Result<Document, IngestError> {
    let filename = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| IngestError::InvalidParameter(format!("{} is not a file", source.display())))?;
    let content_type = content_type
        .map(str::to_string)
        .unwrap_or_else(|| guess_content_type(source).to_string());

    let mut document = Document::pending(user_id, filename.clone(), PathBuf::new(), content_type);
    tokio::fs::create_dir_all(uploads_dir).await?;
    let stored = uploads_dir.join(format!("{}_{}", document.id.simple(), filename));
    tokio::fs::copy(source, &stored).await?;
    document.file_path = stored;

    store.insert(document.clone()).await?;
    tracing::info!(
        document_id = %document.id,
        filename = %document.filename,
        content_type = %document.content_type,
        "registered upload"
    );
    Ok(document)
}
