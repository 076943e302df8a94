//! Retrieval agent: embed the query, search the vector store, hydrate chunks.
//!
//! # Flow
//!
//! 1. Embed the query (bounded by the embedding timeout).
//! 2. Top-`k` cosine search in the active corpus namespace, with the
//!    module/chapter filter evaluated by the store.
//! 3. Drop hits below the similarity floor.
//! 4. Load chunk content from the chunk store. Hits whose chunk is gone
//!    from the active corpus version are dropped, so every candidate refers
//!    to a chunk that exists.
//!
//! An empty result means "no context" and is not an error. Any failure in
//! steps 1, 2 or 4 is retried once after `retry_backoff`. A second failure
//! surfaces as [`QueryError::RetrievalUnavailable`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use book_rag_core::embedding::{embed_one, Embedder};
use book_rag_core::models::{MetadataFilter, RetrievedCandidate};
use book_rag_core::store::{ChunkStore, VectorStore};

use crate::error::QueryError;

/// Run `fut` with a deadline; a timeout becomes an error naming `what`.
pub(crate) async fn with_timeout<T>(
    what: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| anyhow!("{} timed out after {} ms", what, limit.as_millis()))?
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    chunks: Arc<dyn ChunkStore>,
    corpus_version: String,
    floor: f64,
    embed_timeout: Duration,
    search_timeout: Duration,
    retry_backoff: Duration,
}

/// Tunables for [`Retriever`].
#[derive(Debug, Clone)]
pub struct RetrieverSettings {
    pub corpus_version: String,
    pub floor: f64,
    pub embed_timeout: Duration,
    pub search_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        chunks: Arc<dyn ChunkStore>,
        settings: RetrieverSettings,
    ) -> Self {
        Self {
            embedder,
            vectors,
            chunks,
            corpus_version: settings.corpus_version,
            floor: settings.floor,
            embed_timeout: settings.embed_timeout,
            search_timeout: settings.search_timeout,
            retry_backoff: settings.retry_backoff,
        }
    }

    /// Top-`k` candidates at or above the floor, best first.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedCandidate>, QueryError> {
        let filter = filter.filter(|f| !f.is_empty());
        match self.attempt(query, k, filter).await {
            Ok(candidates) => Ok(candidates),
            Err(first) => {
                tracing::warn!(error = %format!("{:#}", first), "retrieval failed, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(query, k, filter).await.map_err(|e| {
                    tracing::error!(error = %format!("{:#}", e), "retrieval failed after retry");
                    QueryError::RetrievalUnavailable(format!("{:#}", e))
                })
            }
        }
    }

    async fn attempt(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedCandidate>> {
        let query_vec = with_timeout(
            "query embedding",
            self.embed_timeout,
            embed_one(self.embedder.as_ref(), query),
        )
        .await?;

        let hits = with_timeout(
            "vector search",
            self.search_timeout,
            self.vectors
                .search(&self.corpus_version, &query_vec, k, filter),
        )
        .await?;

        let hits: Vec<_> = hits.into_iter().filter(|h| h.score >= self.floor).collect();
        if hits.is_empty() {
            tracing::debug!(k, "no hits above similarity floor");
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|h| h.payload.chunk_id.clone()).collect();
        let chunks = with_timeout(
            "chunk lookup",
            self.search_timeout,
            self.chunks.get_chunks(&self.corpus_version, &ids),
        )
        .await?;
        let by_id: HashMap<&str, _> = chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();

        let candidates: Vec<RetrievedCandidate> = hits
            .iter()
            .filter_map(|hit| match by_id.get(hit.payload.chunk_id.as_str()) {
                Some(chunk) => Some(RetrievedCandidate::from_chunk(chunk, hit.score)),
                None => {
                    tracing::debug!(chunk_id = %hit.payload.chunk_id, "vector hit without chunk row");
                    None
                }
            })
            .collect();

        tracing::debug!(hits = hits.len(), candidates = candidates.len(), "retrieved");
        Ok(candidates)
    }
}
