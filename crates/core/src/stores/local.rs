use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::write_json_atomic;
use crate::traits::{check_batch_lengths, VectorIndex};
use crate::{ChunkMetadata, StoreError, VectorMatches, VectorRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    model: Option<String>,
    dimensions: Option<usize>,
    records: Vec<VectorRecord>,
}

/// Vector store held in memory and persisted as one JSON file after every
/// write. Search is an exhaustive cosine scan.
pub struct LocalVectorStore {
    snapshot: RwLock<Snapshot>,
    writer: tokio::sync::Mutex<()>,
    persist_path: Option<PathBuf>,
}

impl LocalVectorStore {
    pub fn open_or_create(vector_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(vector_dir)?;
        let persist_path = vector_dir.join("vectors.json");

        let snapshot = if persist_path.exists() {
            let data = std::fs::read(&persist_path)?;
            serde_json::from_slice(&data)?
        } else {
            Snapshot::default()
        };
        tracing::debug!(
            path = %persist_path.display(),
            records = snapshot.records.len(),
            "opened local vector store"
        );

        Ok(Self {
            snapshot: RwLock::new(snapshot),
            writer: tokio::sync::Mutex::new(()),
            persist_path: Some(persist_path),
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            writer: tokio::sync::Mutex::new(()),
            persist_path: None,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records tagged with `document_id`, in storage order.
    pub fn records_for(&self, document_id: Uuid) -> Vec<VectorRecord> {
        self.snapshot
            .read()
            .records
            .iter()
            .filter(|record| record.metadata.document_id == document_id)
            .cloned()
            .collect()
    }

    /// Applies `change` to a copy of the snapshot, writes the copy and only
    /// then publishes it. Searches never see records that are not on disk.
    async fn apply<T>(
        &self,
        change: impl FnOnce(&mut Snapshot) -> Result<(T, bool), StoreError>,
    ) -> Result<T, StoreError> {
        let _writer = self.writer.lock().await;
        let mut staged = self.snapshot.read().clone();
        let (result, dirty) = change(&mut staged)?;
        if !dirty {
            return Ok(result);
        }

        if let Some(path) = &self.persist_path {
            write_json_atomic(path.clone(), staged.clone()).await?;
        }
        *self.snapshot.write() = staged;
        Ok(result)
    }
}

fn check_dimensions(snapshot: &Snapshot, found: usize) -> Result<(), StoreError> {
    match snapshot.dimensions {
        Some(expected) if expected != found => {
            Err(StoreError::DimensionMismatch { expected, found })
        }
        _ => Ok(()),
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 2.0)
}

#[async_trait]
impl VectorIndex for LocalVectorStore {
    async fn ensure_model(&self, model_id: &str, dimensions: usize) -> Result<(), StoreError> {
        self.apply(|snapshot| {
            if let Some(model) = snapshot.model.as_deref() {
                if model != model_id {
                    return Err(StoreError::ModelMismatch {
                        expected: model.to_string(),
                        found: model_id.to_string(),
                    });
                }
                if snapshot.dimensions.is_some() {
                    return check_dimensions(snapshot, dimensions).map(|()| ((), false));
                }
            }

            snapshot.model = Some(model_id.to_string());
            snapshot.dimensions = Some(dimensions);
            Ok(((), true))
        })
        .await
    }

    async fn upsert(
        &self,
        ids: &[String],
        texts: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
    ) -> Result<(), StoreError> {
        check_batch_lengths(ids, texts, vectors, metadatas)?;
        if ids.is_empty() {
            return Ok(());
        }

        self.apply(|snapshot| {
            for vector in vectors {
                check_dimensions(snapshot, vector.len())?;
            }

            for (((id, text), vector), metadata) in ids.iter().zip(texts).zip(vectors).zip(metadatas) {
                let record = VectorRecord {
                    id: id.clone(),
                    text: text.clone(),
                    embedding: vector.clone(),
                    metadata: *metadata,
                };
                match snapshot.records.iter_mut().find(|existing| existing.id == *id) {
                    Some(existing) => *existing = record,
                    None => snapshot.records.push(record),
                }
            }
            Ok(((), true))
        })
        .await
    }

    async fn search(&self, query_vector: &[f32], k: usize) -> Result<VectorMatches, StoreError> {
        let snapshot = self.snapshot.read();
        check_dimensions(&snapshot, query_vector.len())?;

        let mut scored: Vec<(f64, &VectorRecord)> = snapshot
            .records
            .iter()
            .map(|record| (cosine_distance(query_vector, &record.embedding), record))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(k);

        let mut matches = VectorMatches::default();
        for (distance, record) in scored {
            matches.texts.push(record.text.clone());
            matches.metadatas.push(record.metadata);
            matches.distances.push(distance);
        }
        Ok(matches)
    }

    async fn delete_document(&self, document_id: Uuid) -> Result<usize, StoreError> {
        self.apply(|snapshot| {
            let before = snapshot.records.len();
            snapshot
                .records
                .retain(|record| record.metadata.document_id != document_id);
            let removed = before - snapshot.records.len();
            Ok((removed, removed > 0))
        })
        .await
    }
}
