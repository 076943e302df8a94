//! Qdrant vector store over its REST API.
//!
//! Each corpus version maps to one collection named
//! `{collection_prefix}{namespace}`. Point ids are the chunks' UUIDs, and
//! the [`VectorPayload`] fields are stored as the point payload so that
//! module/chapter filters run inside Qdrant as `must` conditions.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};

use book_rag_core::models::MetadataFilter;
use book_rag_core::store::{VectorHit, VectorPayload, VectorStore};

use crate::config::VectorStoreConfig;
use crate::http::{api_key_from_env, send_json, RetryPolicy};

pub struct QdrantStore {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    collection_prefix: String,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(api_key_from_env(var)?),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            api_key,
            collection_prefix: config.collection_prefix.clone(),
        })
    }

    fn collection(&self, namespace: &str) -> String {
        format!("{}{}", self.collection_prefix, namespace)
    }

    fn request(&self, method: Method, path: &str, body: &serde_json::Value) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.url, path))
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    /// Create the collection for `namespace` if it does not exist yet.
    ///
    /// A failed existence check (bad API key, unreachable server) is
    /// returned as an error rather than treated as a missing collection.
    pub async fn ensure_collection(&self, namespace: &str, dims: usize) -> Result<()> {
        let name = self.collection(namespace);
        let exists_url = format!("{}/collections/{}/exists", self.url, name);
        let json = send_json("Qdrant collection exists", RetryPolicy::NONE, || {
            let req = self.client.get(&exists_url);
            match &self.api_key {
                Some(key) => req.header("api-key", key),
                None => req,
            }
        })
        .await?;
        if parse_exists_response(&json)? {
            return Ok(());
        }

        let body = serde_json::json!({
            "vectors": { "size": dims, "distance": "Cosine" }
        });
        send_json("Qdrant create collection", RetryPolicy::NONE, || {
            self.request(Method::PUT, &format!("/collections/{}", name), &body)
        })
        .await?;
        tracing::info!(collection = %name, dims, "created qdrant collection");
        Ok(())
    }
}

fn parse_exists_response(json: &serde_json::Value) -> Result<bool> {
    json.pointer("/result/exists")
        .and_then(|e| e.as_bool())
        .ok_or_else(|| anyhow!("Qdrant exists response has no result.exists: {}", json))
}

/// Translate a metadata filter into a Qdrant `must` clause.
fn filter_json(filter: &MetadataFilter) -> Option<serde_json::Value> {
    let mut must = Vec::new();
    if let Some(module) = &filter.module {
        must.push(serde_json::json!({ "key": "module", "match": { "value": module } }));
    }
    if let Some(chapter) = &filter.chapter {
        must.push(serde_json::json!({ "key": "chapter", "match": { "value": chapter } }));
    }
    if must.is_empty() {
        None
    } else {
        Some(serde_json::json!({ "must": must }))
    }
}

fn parse_search_response(json: &serde_json::Value) -> Result<Vec<VectorHit>> {
    let result = json
        .get("result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| anyhow!("Invalid Qdrant response: missing result array"))?;

    result
        .iter()
        .map(|point| {
            let id = match point.get("id") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => return Err(anyhow!("Invalid Qdrant response: point without id")),
            };
            let score = point
                .get("score")
                .and_then(|s| s.as_f64())
                .ok_or_else(|| anyhow!("Invalid Qdrant response: point without score"))?;
            let payload: VectorPayload = serde_json::from_value(
                point.get("payload").cloned().unwrap_or(serde_json::Value::Null),
            )
            .map_err(|e| anyhow!("Invalid Qdrant payload for point {}: {}", id, e))?;
            Ok(VectorHit { id, score, payload })
        })
        .collect()
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        vector: &[f32],
        payload: &VectorPayload,
    ) -> Result<()> {
        let body = serde_json::json!({
            "points": [{ "id": id, "vector": vector, "payload": payload }]
        });
        let path = format!("/collections/{}/points?wait=true", self.collection(namespace));
        send_json("Qdrant upsert", RetryPolicy::NONE, || {
            self.request(Method::PUT, &path, &body)
        })
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorHit>> {
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(f) = filter.and_then(filter_json) {
            body["filter"] = f;
        }
        let path = format!("/collections/{}/points/search", self.collection(namespace));
        let json = send_json("Qdrant search", RetryPolicy::NONE, || {
            self.request(Method::POST, &path, &body)
        })
        .await?;
        parse_search_response(&json)
    }
}
