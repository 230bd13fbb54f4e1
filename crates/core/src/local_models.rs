//! In-process embedding and cross-encoder models backed by fastembed.
//!
//! Each wrapper loads its ONNX model lazily on first use, under a mutex, so
//! concurrent first calls load it exactly once. Build one wrapper per process
//! and share it behind an `Arc`.

use async_trait::async_trait;
use fastembed::{
    EmbeddingModel, InitOptions, RerankInitOptions, RerankerModel, TextEmbedding, TextRerank,
};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::embeddings::{l2_normalize, Embedder};
use crate::error::{EmbedError, SearchError};
use crate::rerank::Reranker;

pub const DEFAULT_LOCAL_EMBEDDING_MODEL: &str = "all-minilm-l6-v2";
pub const DEFAULT_LOCAL_RERANK_MODEL: &str = "bge-reranker-base";

fn embedding_model(name: &str) -> Result<(EmbeddingModel, usize), EmbedError> {
    match name {
        "all-minilm-l6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        "bge-large-en-v1.5" => Ok((EmbeddingModel::BGELargeENV15, 1024)),
        "multilingual-e5-small" => Ok((EmbeddingModel::MultilingualE5Small, 384)),
        "multilingual-e5-base" => Ok((EmbeddingModel::MultilingualE5Base, 768)),
        other => Err(EmbedError::UnknownModel(other.to_string())),
    }
}

fn rerank_model(name: &str) -> Result<RerankerModel, EmbedError> {
    match name {
        "bge-reranker-base" => Ok(RerankerModel::BGERerankerBase),
        "jina-reranker-v1-turbo-en" => Ok(RerankerModel::JINARerankerV1TurboEn),
        other => Err(EmbedError::UnknownModel(other.to_string())),
    }
}

pub struct FastEmbedder {
    name: String,
    model_id: String,
    model: EmbeddingModel,
    dimensions: usize,
    loaded: Mutex<Option<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn new(name: &str) -> Result<Self, EmbedError> {
        let (model, dimensions) = embedding_model(name)?;
        Ok(Self {
            name: name.to_string(),
            model_id: format!("fastembed/{name}"),
            model,
            dimensions,
            loaded: Mutex::new(None),
        })
    }

    /// Loads the model now instead of on the first embedding call.
    pub fn warm_up(&self) -> Result<(), EmbedError> {
        let mut slot = self.loaded.lock();
        self.load_into(&mut slot)
    }

    fn load_into(&self, slot: &mut Option<TextEmbedding>) -> Result<(), EmbedError> {
        if slot.is_none() {
            tracing::info!(model = %self.name, "loading embedding model");
            let model = TextEmbedding::try_new(
                InitOptions::new(self.model.clone()).with_show_download_progress(false),
            )
            .map_err(|error| EmbedError::ModelLoad {
                model: self.name.clone(),
                details: error.to_string(),
            })?;
            *slot = Some(model);
        }
        Ok(())
    }
}

impl Embedder for FastEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut slot = self.loaded.lock();
        self.load_into(&mut slot)?;
        let model = slot
            .as_mut()
            .ok_or_else(|| EmbedError::Inference("embedding model is not loaded".into()))?;

        let mut vectors = model
            .embed(texts.to_vec(), None)
            .map_err(|error| EmbedError::Inference(error.to_string()))?;
        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

pub struct FastEmbedReranker {
    name: String,
    model: RerankerModel,
    loaded: Arc<Mutex<Option<TextRerank>>>,
}

impl FastEmbedReranker {
    pub fn new(name: &str) -> Result<Self, EmbedError> {
        Ok(Self {
            name: name.to_string(),
            model: rerank_model(name)?,
            loaded: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl Reranker for FastEmbedReranker {
    fn model_id(&self) -> &str {
        &self.name
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, SearchError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let loaded = self.loaded.clone();
        let model_choice = self.model.clone();
        let name = self.name.clone();
        let query = query.to_string();
        let passages = passages.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut slot = loaded.lock();
            if slot.is_none() {
                tracing::info!(model = %name, "loading cross-encoder model");
                let model = TextRerank::try_new(RerankInitOptions::new(model_choice))
                    .map_err(|error| SearchError::Rerank(format!("failed to load {name}: {error}")))?;
                *slot = Some(model);
            }
            let model = slot
                .as_mut()
                .ok_or_else(|| SearchError::Rerank("cross-encoder is not loaded".into()))?;

            let documents: Vec<&str> = passages.iter().map(String::as_str).collect();
            let results = model
                .rerank(query.as_str(), documents, false, None)
                .map_err(|error| SearchError::Rerank(error.to_string()))?;

            let mut scores = vec![f64::NEG_INFINITY; passages.len()];
            for result in results {
                if let Some(entry) = scores.get_mut(result.index) {
                    *entry = result.score as f64;
                }
            }
            Ok(scores)
        })
        .await
        .map_err(|error| SearchError::Task(error.to_string()))?
    }
}
