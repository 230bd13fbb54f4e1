use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::{LlmError, SearchError};
use crate::models::RetrievalMode;

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_RECALL_MULTIPLIER: usize = 2;
pub const DEFAULT_RERANK_CANDIDATES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalSettings {
    pub mode: RetrievalMode,
    pub top_k: usize,
    /// Recall size factor for rerank mode when `rerank_candidates` is unset.
    pub recall_multiplier: usize,
    /// Fixed recall size for rerank mode.
    pub rerank_candidates: Option<usize>,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::default(),
            top_k: DEFAULT_TOP_K,
            recall_multiplier: DEFAULT_RECALL_MULTIPLIER,
            rerank_candidates: Some(DEFAULT_RERANK_CANDIDATES),
        }
    }
}

impl RetrievalSettings {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.top_k == 0 {
            return Err(SearchError::InvalidTopK(self.top_k));
        }
        Ok(())
    }

    /// Number of hybrid candidates gathered before reranking.
    pub fn rerank_recall_size(&self, top_k: usize) -> usize {
        match self.rerank_candidates {
            Some(candidates) => candidates.max(top_k),
            None => top_k.saturating_mul(self.recall_multiplier).max(top_k),
        }
    }
}

/// Cross-encoder sidecar reachable over an OpenAI-style `/v1/rerank` route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RerankerSettings {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            model: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    /// Extra attempts after the first one for blocking generation.
    pub max_retries: u32,
    /// Backoff before retry `n` is `base_delay * 2^n`.
    pub base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            temperature: 0.2,
            max_retries: 3,
            base_delay: Duration::from_millis(800),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// A validated language-model endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmEndpoint {
    pub api_key: String,
    pub base_url: Url,
    pub model: String,
}

impl LlmEndpoint {
    pub fn chat_completions_url(&self) -> Result<Url, url::ParseError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join("chat/completions")
    }
}

impl LlmSettings {
    /// Reads `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `OPENAI_MODEL`.
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            api_key: read("OPENAI_API_KEY"),
            base_url: read("OPENAI_BASE_URL"),
            model: read("OPENAI_MODEL"),
            ..Self::default()
        }
    }

    pub fn endpoint(&self) -> Result<LlmEndpoint, LlmError> {
        let required = |value: &Option<String>, name: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| LlmError::Configuration(format!("missing {name}")))
        };

        let api_key = required(&self.api_key, "OPENAI_API_KEY")?;
        let base_url = required(&self.base_url, "OPENAI_BASE_URL")?;
        let model = required(&self.model, "OPENAI_MODEL")?;
        let base_url = Url::parse(&base_url)
            .map_err(|error| LlmError::Configuration(format!("invalid OPENAI_BASE_URL: {error}")))?;

        Ok(LlmEndpoint {
            api_key,
            base_url,
            model,
        })
    }
}
