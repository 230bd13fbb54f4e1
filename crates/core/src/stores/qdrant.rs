use crate::traits::{check_batch_lengths, VectorIndex};
use crate::{ChunkMetadata, StoreError, VectorMatches};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

/// Collection in a Qdrant server, addressed over its REST API.
///
/// Points carry `text`, `document_id`, `chunk_index` and `embedding_model` in
/// their payload. The collection uses cosine similarity; distances reported
/// to callers are `1 - similarity`.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    bound: RwLock<Option<(String, usize)>>,
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>) -> Self {
        let endpoint: String = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            bound: RwLock::new(None),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.endpoint, self.collection, suffix)
    }

    fn bound_model(&self) -> Option<String> {
        self.bound.read().as_ref().map(|(model, _)| model.clone())
    }

    async fn collection_size(&self) -> Result<Option<usize>, StoreError> {
        let response = self.client.get(self.url("")).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let parsed = expect_success(response).await?;
        let size = parsed
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: "qdrant".to_string(),
                details: "collection has no single unnamed vector".to_string(),
            })?;
        Ok(Some(size as usize))
    }

    async fn create_collection(&self, dimensions: usize) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.url(""))
            .json(&json!({
                "vectors": { "size": dimensions, "distance": "Cosine" }
            }))
            .send()
            .await?;
        expect_success(response).await?;
        tracing::info!(collection = %self.collection, dimensions, "created qdrant collection");
        Ok(())
    }

    /// Model name of any point embedded by something other than `model_id`.
    async fn foreign_model(&self, model_id: &str) -> Result<Option<String>, StoreError> {
        let response = self
            .client
            .post(self.url("/points/scroll"))
            .json(&json!({
                "filter": { "must_not": [model_condition(model_id)] },
                "limit": 1,
                "with_payload": ["embedding_model"],
                "with_vector": false,
            }))
            .send()
            .await?;

        let parsed = expect_success(response).await?;
        Ok(parsed
            .pointer("/result/points/0/payload/embedding_model")
            .map(|value| value.as_str().unwrap_or("unknown").to_string()))
    }

    async fn count(&self, filter: &Value) -> Result<usize, StoreError> {
        let response = self
            .client
            .post(self.url("/points/count"))
            .json(&json!({ "filter": filter, "exact": true }))
            .send()
            .await?;

        let parsed = expect_success(response).await?;
        Ok(parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}

fn model_condition(model_id: &str) -> Value {
    json!({ "key": "embedding_model", "match": { "value": model_id } })
}

fn document_filter(document_id: Uuid) -> Value {
    json!({
        "must": [{ "key": "document_id", "match": { "value": document_id.to_string() } }]
    })
}

async fn expect_success(response: Response) -> Result<Value, StoreError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::BackendResponse {
            backend: "qdrant".to_string(),
            details: format!("{status}: {body}"),
        });
    }
    Ok(response.json().await?)
}

fn parse_hit(hit: &Value) -> Result<(String, ChunkMetadata, f64), StoreError> {
    let malformed = |field: &str| StoreError::BackendResponse {
        backend: "qdrant".to_string(),
        details: format!("search hit without {field}"),
    };

    let text = hit
        .pointer("/payload/text")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("text"))?
        .to_string();
    let document_id = hit
        .pointer("/payload/document_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| malformed("document_id"))?;
    let chunk_index = hit
        .pointer("/payload/chunk_index")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("chunk_index"))? as usize;
    let similarity = hit
        .pointer("/score")
        .and_then(Value::as_f64)
        .ok_or_else(|| malformed("score"))?;

    Ok((
        text,
        ChunkMetadata {
            document_id,
            chunk_index,
        },
        (1.0 - similarity).clamp(0.0, 2.0),
    ))
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn ensure_model(&self, model_id: &str, dimensions: usize) -> Result<(), StoreError> {
        if let Some((model, size)) = self.bound.read().as_ref() {
            if model == model_id && *size == dimensions {
                return Ok(());
            }
        }

        match self.collection_size().await? {
            None => self.create_collection(dimensions).await?,
            Some(expected) if expected != dimensions => {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    found: dimensions,
                })
            }
            Some(_) => {
                if let Some(expected) = self.foreign_model(model_id).await? {
                    return Err(StoreError::ModelMismatch {
                        expected,
                        found: model_id.to_string(),
                    });
                }
            }
        }

        *self.bound.write() = Some((model_id.to_string(), dimensions));
        Ok(())
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

        let (model, size) = self.bound.read().clone().ok_or_else(|| {
            StoreError::BackendResponse {
                backend: "qdrant".to_string(),
                details: "upsert before ensure_model".to_string(),
            }
        })?;

        let points = ids
            .iter()
            .zip(texts)
            .zip(vectors)
            .zip(metadatas)
            .map(|(((id, text), vector), metadata)| {
                if vector.len() != size {
                    return Err(StoreError::DimensionMismatch {
                        expected: size,
                        found: vector.len(),
                    });
                }

                Ok(json!({
                    "id": id,
                    "vector": vector,
                    "payload": {
                        "text": text,
                        "document_id": metadata.document_id.to_string(),
                        "chunk_index": metadata.chunk_index,
                        "embedding_model": model,
                    },
                }))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let response = self
            .client
            .put(self.url("/points?wait=true"))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        expect_success(response).await?;

        Ok(())
    }

    async fn search(&self, query_vector: &[f32], k: usize) -> Result<VectorMatches, StoreError> {
        let mut request = json!({
            "vector": query_vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(model) = self.bound_model() {
            request["filter"] = json!({ "must": [model_condition(&model)] });
        }

        let response = self
            .client
            .post(self.url("/points/search"))
            .json(&request)
            .send()
            .await?;
        let parsed = expect_success(response).await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut matches = VectorMatches::default();
        for hit in &hits {
            let (text, metadata, distance) = parse_hit(hit)?;
            matches.texts.push(text);
            matches.metadatas.push(metadata);
            matches.distances.push(distance);
        }
        Ok(matches)
    }

    async fn delete_document(&self, document_id: Uuid) -> Result<usize, StoreError> {
        if self.collection_size().await?.is_none() {
            return Ok(0);
        }

        let filter = document_filter(document_id);
        let existing = self.count(&filter).await?;
        if existing == 0 {
            return Ok(0);
        }

        let response = self
            .client
            .post(self.url("/points/delete?wait=true"))
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        expect_success(response).await?;

        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_convert_similarity_to_distance() {
        let document_id = Uuid::new_v4();
        let hit = json!({
            "id": Uuid::new_v4().to_string(),
            "score": 0.75,
            "payload": {
                "text": "pump curves",
                "document_id": document_id.to_string(),
                "chunk_index": 3,
                "embedding_model": "char-trigram-128",
            }
        });

        let (text, metadata, distance) = parse_hit(&hit).unwrap();
        assert_eq!(text, "pump curves");
        assert_eq!(metadata.document_id, document_id);
        assert_eq!(metadata.chunk_index, 3);
        assert!((distance - 0.25).abs() < 1e-12);
    }

    #[test]
    fn rounding_above_one_never_yields_a_negative_distance() {
        let hit = json!({
            "id": Uuid::new_v4().to_string(),
            "score": 1.000_000_2,
            "payload": {
                "text": "pump curves",
                "document_id": Uuid::new_v4().to_string(),
                "chunk_index": 0,
            }
        });

        let (_, _, distance) = parse_hit(&hit).unwrap();
        assert_eq!(distance, 0.0);
    }

    #[test]
    fn hits_without_payload_are_rejected() {
        let hit = json!({ "id": 1, "score": 0.5 });
        assert!(matches!(
            parse_hit(&hit),
            Err(StoreError::BackendResponse { .. })
        ));
    }

    #[test]
    fn urls_are_scoped_to_the_collection() {
        let store = QdrantStore::new("http://localhost:6333/", "chunks");
        assert_eq!(
            store.url("/points/search"),
            "http://localhost:6333/collections/chunks/points/search"
        );
    }

    #[tokio::test]
    async fn mismatched_batches_fail_before_any_request() {
        let store = QdrantStore::new("http://127.0.0.1:9", "chunks");
        let error = store
            .upsert(&["a".into()], &[], &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::LengthMismatch { .. }));
    }
}
