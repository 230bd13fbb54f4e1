use crate::embeddings::{embed_blocking, Embedder};
use crate::lexical::keyword_score;
use crate::rerank::{rerank, Reranker};
use crate::traits::VectorIndex;
use crate::{RequestContext, RetrievalMode, RetrievalSettings, RetrievedChunk, SearchError};
use std::sync::Arc;
use tracing::Instrument;

const VECTOR_WEIGHT: f64 = 0.7;
const KEYWORD_WEIGHT: f64 = 0.3;
const DISTANCE_EPSILON: f64 = 1e-6;

/// Hybrid fusion of a vector distance and a lexical overlap count.
///
/// Strictly increasing in `keyword` and decreasing in `distance`.
pub fn fused_score(distance: f64, keyword: f64) -> f64 {
    VECTOR_WEIGHT * (1.0 / (distance + DISTANCE_EPSILON)) + KEYWORD_WEIGHT * keyword
}

/// Turns a query into ranked passages using one of three strategies.
pub struct RetrievalOrchestrator {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    reranker: Option<Arc<dyn Reranker>>,
    settings: RetrievalSettings,
}

impl RetrievalOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        settings: RetrievalSettings,
    ) -> Result<Self, SearchError> {
        settings.validate()?;
        Ok(Self {
            embedder,
            index,
            reranker: None,
            settings,
        })
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Retrieves with the configured mode and `top_k`.
    pub async fn retrieve(
        &self,
        ctx: &RequestContext,
        query: &str,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        self.retrieve_with(ctx, query, self.settings.mode, self.settings.top_k)
            .await
    }

    pub async fn retrieve_with(
        &self,
        ctx: &RequestContext,
        query: &str,
        mode: RetrievalMode,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if top_k == 0 {
            return Err(SearchError::InvalidTopK(top_k));
        }

        let span = tracing::info_span!("retrieve", trace_id = %ctx.trace_id, mode = %mode, top_k);
        async move {
            let chunks = match mode {
                RetrievalMode::Vector => self.vector(query, top_k).await?,
                RetrievalMode::Hybrid => self.hybrid(query, top_k).await?,
                RetrievalMode::Rerank => self.rerank(query, top_k).await?,
            };
            tracing::debug!(returned = chunks.len(), "retrieval finished");
            Ok(chunks)
        }
        .instrument(span)
        .await
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, SearchError> {
        let vectors = embed_blocking(self.embedder.clone(), vec![query.to_string()]).await?;
        let query_vector = vectors.into_iter().next().unwrap_or_default();

        self.index
            .ensure_model(self.embedder.model_id(), self.embedder.dimensions())
            .await?;
        let matches = self.index.search(&query_vector, k).await?;
        Ok(matches.into_chunks())
    }

    async fn vector(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, SearchError> {
        self.search(query, top_k).await
    }

    async fn hybrid(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, SearchError> {
        let recall = top_k.saturating_mul(2).max(top_k);
        let mut candidates = self.search(query, recall).await?;

        for candidate in &mut candidates {
            let keyword = keyword_score(&candidate.text, query)?;
            candidate.keyword_score = Some(keyword);
            candidate.final_score = Some(fused_score(candidate.score, keyword));
        }
        candidates.sort_by(|left, right| {
            let left = left.final_score.unwrap_or(f64::NEG_INFINITY);
            let right = right.final_score.unwrap_or(f64::NEG_INFINITY);
            right.total_cmp(&left)
        });
        candidates.truncate(top_k);
        Ok(candidates)
    }

    async fn rerank(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, SearchError> {
        let reranker = self.reranker.as_deref().ok_or(SearchError::RerankerMissing)?;

        let recall = self.settings.rerank_recall_size(top_k);
        let candidates = self.hybrid(query, recall).await?;
        tracing::debug!(candidates = candidates.len(), model = reranker.model_id(), "reranking");

        let mut ranked = rerank(reranker, query, candidates).await?;
        ranked.truncate(top_k);
        Ok(ranked)
    }
}
