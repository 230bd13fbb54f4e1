//! Cross-encoder reranking: score every (query, passage) pair and reorder.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RerankerSettings;
use crate::error::SearchError;
use crate::models::RetrievedChunk;

/// Pairwise relevance scorer. Higher scores mean more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn model_id(&self) -> &str;

    /// One score per passage, aligned with the input order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, SearchError>;
}

/// Attaches `rerank_score` to every chunk and sorts them best first.
pub async fn rerank(
    reranker: &dyn Reranker,
    query: &str,
    mut chunks: Vec<RetrievedChunk>,
) -> Result<Vec<RetrievedChunk>, SearchError> {
    if chunks.is_empty() {
        return Ok(chunks);
    }

    let passages: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let scores = reranker.score(query, &passages).await?;
    if scores.len() != chunks.len() {
        return Err(SearchError::Rerank(format!(
            "{} returned {} scores for {} passages",
            reranker.model_id(),
            scores.len(),
            chunks.len()
        )));
    }

    for (chunk, score) in chunks.iter_mut().zip(scores) {
        chunk.rerank_score = Some(score);
    }
    chunks.sort_by(|left, right| {
        let left = left.rerank_score.unwrap_or(f64::NEG_INFINITY);
        let right = right.rerank_score.unwrap_or(f64::NEG_INFINITY);
        right.total_cmp(&left)
    });
    Ok(chunks)
}

/// Sigmoid normalization: maps raw logits to the 0-1 range.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Cross-encoder served over an OpenAI-compatible `/v1/rerank` endpoint.
pub struct HttpCrossEncoder {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl HttpCrossEncoder {
    pub fn new(settings: &RerankerSettings) -> Result<Self, SearchError> {
        let base_url = settings
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(SearchError::RerankerMissing)?;

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone().unwrap_or_else(|| "default".to_string()),
            timeout: Duration::from_secs(settings.timeout_secs.clamp(1, 30)),
        })
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRaw>,
}

#[derive(Deserialize)]
struct RerankResultRaw {
    index: usize,
    relevance_score: f64,
}

fn align_scores(results: Vec<RerankResultRaw>, passages: usize) -> Result<Vec<f64>, SearchError> {
    let mut scores = vec![None; passages];
    for result in results {
        match scores.get_mut(result.index) {
            Some(slot) => *slot = Some(sigmoid(result.relevance_score)),
            None => {
                return Err(SearchError::Rerank(format!(
                    "reranker referenced passage {} of {passages}",
                    result.index
                )))
            }
        }
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(index, score)| {
            score.ok_or_else(|| SearchError::Rerank(format!("reranker skipped passage {index}")))
        })
        .collect()
}

#[async_trait]
impl Reranker for HttpCrossEncoder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, SearchError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/v1/rerank", self.base_url))
            .timeout(self.timeout)
            .json(&RerankRequest {
                model: &self.model,
                query,
                documents: passages,
                top_n: passages.len(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Rerank(format!("reranker returned {status}: {body}")));
        }

        let body: RerankResponse = response.json().await?;
        align_scores(body.results, passages.len())
    }
}
