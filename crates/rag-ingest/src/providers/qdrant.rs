//! Qdrant vector store over the REST API

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::config::VectorDbConfig;
use crate::error::{Error, Result};

use super::vector_store::{SearchFilter, SearchHit, VectorPoint, VectorStoreProvider};

/// Qdrant response envelope
#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct ExistsResult {
    exists: bool,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

/// Qdrant vector store
pub struct QdrantStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl QdrantStore {
    /// Create a new Qdrant client
    pub fn new(config: &VectorDbConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    /// Send a request and decode the `result` field of the response
    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.with_auth(request).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(format!("qdrant {}", operation), self.timeout_secs)
            } else {
                Error::vector_db(format!("qdrant {} connection failed: {}", operation, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(operation, status, &body));
        }

        let parsed: QdrantResponse<T> = response.json().await.map_err(|e| {
            Error::vector_db(format!("qdrant {}: malformed response: {}", operation, e))
        })?;
        Ok(parsed.result)
    }

    async fn create_payload_index(&self, collection: &str, field: &str, schema: &str) -> Result<()> {
        let request = self
            .client
            .put(self.url(&format!("/collections/{}/index?wait=true", collection)))
            .json(&json!({ "field_name": field, "field_schema": schema }));

        match self.send::<Value>("create index", request).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Create calls that lost a race with another writer
fn is_already_exists(error: &Error) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("already exists") || message.contains("http 409")
}

fn status_error(operation: &str, status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::vector_db(format!(
            "qdrant {} rate limited: HTTP 429 Too Many Requests - {}",
            operation, body
        )),
        s if s.is_server_error() => Error::vector_db(format!(
            "qdrant {} unavailable: HTTP {} - {}",
            operation, s, body
        )),
        s => Error::vector_db(format!("qdrant {} rejected: HTTP {} - {}", operation, s, body)),
    }
}

fn filter_json(filter: &SearchFilter) -> Option<Value> {
    filter.document_ids.as_ref().map(|ids| {
        json!({
            "must": [{ "key": "document_id", "match": { "any": ids } }]
        })
    })
}

fn document_filter(document_id: &str) -> Value {
    json!({
        "must": [{ "key": "document_id", "match": { "value": document_id } }]
    })
}

fn point_json(point: &VectorPoint) -> Value {
    json!({
        "id": point.id.to_string(),
        "vector": point.vector,
        "payload": {
            "text": point.text,
            "document_id": point.document_id,
            "document_name": point.document_name,
            "chunk_id": point.chunk_id,
        }
    })
}

fn hit_from_scored(scored: ScoredPoint) -> SearchHit {
    let payload = scored.payload.unwrap_or(Value::Null);
    let text_field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let id = scored
        .id
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::nil);

    SearchHit {
        point: VectorPoint {
            id,
            vector: Vec::new(),
            text: text_field("text"),
            document_id: text_field("document_id"),
            document_name: text_field("document_name"),
            chunk_id: payload
                .get("chunk_id")
                .and_then(Value::as_u64)
                .unwrap_or_default() as usize,
        },
        score: scored.score,
    }
}

#[async_trait]
impl VectorStoreProvider for QdrantStore {
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<()> {
        let exists: ExistsResult = self
            .send(
                "collection exists",
                self.client.get(self.url(&format!("/collections/{}/exists", collection))),
            )
            .await?;

        if !exists.exists {
            let request = self
                .client
                .put(self.url(&format!("/collections/{}", collection)))
                .json(&json!({ "vectors": { "size": dimensions, "distance": "Cosine" } }));
            match self.send::<Value>("create collection", request).await {
                Ok(_) => tracing::info!("Created collection: {}", collection),
                Err(e) if is_already_exists(&e) => {
                    tracing::debug!("Collection {} created concurrently", collection)
                }
                Err(e) => return Err(e),
            }
        }

        self.create_payload_index(collection, "document_id", "keyword").await?;
        self.create_payload_index(collection, "chunk_id", "integer").await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<()> {
        let body = json!({ "points": points.iter().map(point_json).collect::<Vec<_>>() });
        let request = self
            .client
            .put(self.url(&format!("/collections/{}/points?wait=true", collection)))
            .json(&body);
        self.send::<Value>("upsert", request).await?;
        tracing::debug!("Upserted {} points to {}", points.len(), collection);
        Ok(())
    }

    async fn delete_by_document(&self, collection: &str, document_id: &str) -> Result<usize> {
        let filter = document_filter(document_id);

        let counted: CountResult = self
            .send(
                "count",
                self.client
                    .post(self.url(&format!("/collections/{}/points/count", collection)))
                    .json(&json!({ "filter": filter, "exact": true })),
            )
            .await?;

        self.send::<Value>(
            "delete",
            self.client
                .post(self.url(&format!("/collections/{}/points/delete?wait=true", collection)))
                .json(&json!({ "filter": filter })),
        )
        .await?;

        tracing::info!(
            "Deleted {} points for document {} from {}",
            counted.count,
            document_id,
            collection
        );
        Ok(counted.count)
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>> {
        let mut body = json!({
            "vector": query_vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter.and_then(filter_json) {
            body["filter"] = filter;
        }

        let scored: Vec<ScoredPoint> = self
            .send(
                "search",
                self.client
                    .post(self.url(&format!("/collections/{}/points/search", collection)))
                    .json(&body),
            )
            .await?;

        Ok(scored.into_iter().map(hit_from_scored).collect())
    }

    async fn health_check(&self) -> Result<bool> {
        let request = self.with_auth(self.client.get(self.url("/collections")));
        match request.send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn name(&self) -> &str {
        "qdrant"
    }
}
