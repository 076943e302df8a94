//! Storage abstractions for the query pipeline.
//!
//! Three traits split storage along the lines of the external systems that
//! back them in production:
//!
//! | Trait | Production backend | Purpose |
//! |-------|--------------------|---------|
//! | [`VectorStore`] | Qdrant or SQLite | Namespaced upsert and top-k cosine search |
//! | [`ChunkStore`] | SQLite | Chunk content and provenance, deduplicated by hash |
//! | [`SessionStore`] | SQLite | Sessions and their ordered messages |
//!
//! [`memory`] provides in-process implementations of all three for tests.
//! Implementations must be `Send + Sync` to be shared across request tasks.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Chunk, MetadataFilter, Message, NewMessage, Session};

/// Metadata stored next to each vector, used for store-side filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    pub chunk_id: String,
    pub module: String,
    pub chapter: String,
    pub section: String,
    pub chunk_index: i64,
}

impl VectorPayload {
    pub fn for_chunk(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            module: chunk.module.clone(),
            chapter: chunk.chapter.clone(),
            section: chunk.section.clone(),
            chunk_index: chunk.chunk_index,
        }
    }
}

/// One result of a vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Point id (the chunk's `embedding_ref`).
    pub id: String,
    /// Cosine similarity.
    pub score: f64,
    pub payload: VectorPayload,
}

/// Similarity search over embeddings, partitioned by namespace.
///
/// The namespace is the corpus version. Filters are applied by the store
/// before ranking so that `k` results always come from the filtered set.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector for `id` in `namespace`.
    async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        vector: &[f32],
        payload: &VectorPayload,
    ) -> Result<()>;

    /// Top-`k` hits by cosine similarity, best first.
    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorHit>>;
}

/// Result of [`ChunkStore::put_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWrite {
    /// Id of the stored chunk, which is the existing one on a hash match.
    pub chunk_id: String,
    /// False when an identical chunk was already present.
    pub created: bool,
}

/// Relational storage of chunk content.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a chunk unless one with the same content hash already exists
    /// in the same corpus version.
    async fn put_chunk(&self, chunk: &Chunk) -> Result<ChunkWrite>;

    /// Fetch chunks by id within a corpus version. Unknown ids are skipped.
    async fn get_chunks(&self, corpus_version: &str, ids: &[String]) -> Result<Vec<Chunk>>;

    async fn find_by_hash(&self, corpus_version: &str, content_hash: &str)
        -> Result<Option<Chunk>>;

    async fn count_chunks(&self, corpus_version: &str) -> Result<i64>;
}

/// Parameters for creating or resuming a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionKey<'a> {
    pub session_id: &'a str,
    pub user_id: Option<&'a str>,
    pub corpus_version: &'a str,
}

/// Sessions and their message history.
///
/// # Guarantees
///
/// - [`get_or_create`](SessionStore::get_or_create) is idempotent: racing
///   callers with the same id all observe one session.
/// - [`append_message`](SessionStore::append_message) inserts the message,
///   bumps `message_count` and `updated_at`, and assigns `seq` in a single
///   atomic step. Appends on one session serialize.
/// - [`list_messages`](SessionStore::list_messages) returns messages in
///   ascending `seq` order.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_or_create(&self, key: SessionKey<'_>) -> Result<Session>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Append a message. Fails if the session does not exist.
    async fn append_message(&self, session_id: &str, message: &NewMessage) -> Result<Message>;

    /// Up to `limit` messages with `seq > after_seq`, oldest first.
    async fn list_messages(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Message>>;
}
