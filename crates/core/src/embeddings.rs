use std::sync::Arc;

use crate::error::EmbedError;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Maps text to fixed-length, L2-normalized vectors.
///
/// Implementations are built once per process and shared behind an `Arc`.
/// Corpus and query vectors must come from the same instance: `model_id`
/// identifies the vector space and vector indexes refuse to mix two of them.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_many(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or(EmbedError::CountMismatch {
                expected: 1,
                found: 0,
            })
    }
}

/// Runs a batch embedding on the blocking pool and checks the batch size.
pub async fn embed_blocking(
    embedder: Arc<dyn Embedder>,
    texts: Vec<String>,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let expected = texts.len();
    let vectors = tokio::task::spawn_blocking(move || embedder.embed_many(&texts))
        .await
        .map_err(|error| EmbedError::Inference(format!("embedding task aborted: {error}")))??;

    if vectors.len() != expected {
        return Err(EmbedError::CountMismatch {
            expected,
            found: vectors.len(),
        });
    }
    Ok(vectors)
}

pub fn l2_normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

/// Hashes character trigrams into buckets. Deterministic, dependency free and
/// cheap to build, used when no neural model is configured.
#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    dimensions: usize,
    model_id: String,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("char-trigram-{dimensions}"),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        // Texts too short for a trigram, the empty one included, still get a
        // unit vector so no stored record has an undefined cosine distance.
        if chars.len() < 3 {
            let bucket = bucket_for(&chars, vector.len());
            vector[bucket] = 1.0;
            return vector;
        }

        for window in chars.windows(3) {
            let bucket = bucket_for(window, vector.len());
            vector[bucket] += 1.0;
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

fn bucket_for(window: &[char], buckets: usize) -> usize {
    let mut hash = 1469598103934665603u64;
    let mut encoded = [0u8; 4];
    for character in window {
        for byte in character.encode_utf8(&mut encoded).bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
    }
    (hash % buckets as u64) as usize
}

impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}
