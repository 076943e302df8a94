//! In-memory store implementations for tests and local experiments.
//!
//! Each store keeps its state behind a `std::sync` lock. Vector search is
//! brute-force cosine similarity over the namespace. The session store
//! holds a single mutex across an append, which gives the same
//! serialization per session that the SQLite transaction provides.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, MetadataFilter, Message, NewMessage, Session};

use super::{
    ChunkStore, ChunkWrite, SessionKey, SessionStore, VectorHit, VectorPayload, VectorStore,
};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StoredVector {
    id: String,
    vector: Vec<f32>,
    payload: VectorPayload,
}

/// Brute-force vector index keyed by namespace.
#[derive(Default)]
pub struct InMemoryVectorStore {
    namespaces: RwLock<HashMap<String, Vec<StoredVector>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        vector: &[f32],
        payload: &VectorPayload,
    ) -> Result<()> {
        let mut namespaces = write(&self.namespaces);
        let points = namespaces.entry(namespace.to_string()).or_default();
        points.retain(|p| p.id != id);
        points.push(StoredVector {
            id: id.to_string(),
            vector: vector.to_vec(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorHit>> {
        let namespaces = read(&self.namespaces);
        let Some(points) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<VectorHit> = points
            .iter()
            .filter(|p| filter.map_or(true, |f| f.matches(&p.payload.module, &p.payload.chapter)))
            .map(|p| VectorHit {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector) as f64,
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Chunk table keyed by chunk id.
#[derive(Default)]
pub struct InMemoryChunkStore {
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn put_chunk(&self, chunk: &Chunk) -> Result<ChunkWrite> {
        let mut chunks = write(&self.chunks);
        if let Some(existing) = chunks.values().find(|c| {
            c.corpus_version == chunk.corpus_version && c.content_hash == chunk.content_hash
        }) {
            return Ok(ChunkWrite {
                chunk_id: existing.chunk_id.clone(),
                created: false,
            });
        }
        chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        Ok(ChunkWrite {
            chunk_id: chunk.chunk_id.clone(),
            created: true,
        })
    }

    async fn get_chunks(&self, corpus_version: &str, ids: &[String]) -> Result<Vec<Chunk>> {
        let chunks = read(&self.chunks);
        Ok(ids
            .iter()
            .filter_map(|id| chunks.get(id))
            .filter(|c| c.corpus_version == corpus_version)
            .cloned()
            .collect())
    }

    async fn find_by_hash(
        &self,
        corpus_version: &str,
        content_hash: &str,
    ) -> Result<Option<Chunk>> {
        let chunks = read(&self.chunks);
        Ok(chunks
            .values()
            .find(|c| c.corpus_version == corpus_version && c.content_hash == content_hash)
            .cloned())
    }

    async fn count_chunks(&self, corpus_version: &str) -> Result<i64> {
        let chunks = read(&self.chunks);
        Ok(chunks
            .values()
            .filter(|c| c.corpus_version == corpus_version)
            .count() as i64)
    }
}

struct SessionEntry {
    session: Session,
    messages: Vec<Message>,
}

/// Sessions and messages behind one mutex.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, key: SessionKey<'_>) -> Result<Session> {
        let mut sessions = lock(&self.sessions);
        let entry = sessions
            .entry(key.session_id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                SessionEntry {
                    session: Session {
                        session_id: key.session_id.to_string(),
                        user_id: key.user_id.map(str::to_string),
                        corpus_version: key.corpus_version.to_string(),
                        created_at: now,
                        updated_at: now,
                        message_count: 0,
                    },
                    messages: Vec::new(),
                }
            });
        Ok(entry.session.clone())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = lock(&self.sessions);
        Ok(sessions.get(session_id).map(|e| e.session.clone()))
    }

    async fn append_message(&self, session_id: &str, message: &NewMessage) -> Result<Message> {
        let mut sessions = lock(&self.sessions);
        let Some(entry) = sessions.get_mut(session_id) else {
            bail!("Session not found: {}", session_id);
        };
        let now = Utc::now();
        entry.session.message_count += 1;
        entry.session.updated_at = now;
        let stored = Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            seq: entry.session.message_count,
            user_text: message.user_text.clone(),
            assistant_text: message.assistant_text.clone(),
            mode: message.mode,
            selected_text: message.selected_text.clone(),
            source_refs: message.source_refs.clone(),
            grounded: message.grounded,
            latency_ms: message.latency_ms,
            created_at: now,
        };
        entry.messages.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let sessions = lock(&self.sessions);
        Ok(sessions
            .get(session_id)
            .map(|e| {
                e.messages
                    .iter()
                    .filter(|m| m.seq > after_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mode;
    use std::sync::Arc;

    fn payload(id: &str, module: &str) -> VectorPayload {
        VectorPayload {
            chunk_id: id.to_string(),
            module: module.to_string(),
            chapter: "ch1".to_string(),
            section: "s1".to_string(),
            chunk_index: 0,
        }
    }

    fn new_message(text: &str) -> NewMessage {
        NewMessage {
            user_text: text.to_string(),
            assistant_text: "answer".to_string(),
            mode: Mode::FullCorpus,
            selected_text: None,
            source_refs: Vec::new(),
            grounded: true,
            latency_ms: 5,
        }
    }

    fn key(id: &str) -> SessionKey<'_> {
        SessionKey {
            session_id: id,
            user_id: None,
            corpus_version: "v1",
        }
    }

    #[tokio::test]
    async fn test_vector_search_orders_and_filters() {
        let store = InMemoryVectorStore::new();
        store.upsert("v1", "a", &[1.0, 0.0], &payload("a", "m1")).await.unwrap();
        store.upsert("v1", "b", &[0.7, 0.7], &payload("b", "m1")).await.unwrap();
        store.upsert("v1", "c", &[1.0, 0.1], &payload("c", "m2")).await.unwrap();
        store.upsert("v2", "d", &[1.0, 0.0], &payload("d", "m1")).await.unwrap();

        let hits = store.search("v1", &[1.0, 0.0], 10, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        let filter = MetadataFilter {
            module: Some("m1".into()),
            chapter: None,
        };
        let hits = store.search("v1", &[1.0, 0.0], 1, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn test_vector_upsert_replaces() {
        let store = InMemoryVectorStore::new();
        store.upsert("v1", "a", &[1.0, 0.0], &payload("a", "m1")).await.unwrap();
        store.upsert("v1", "a", &[0.0, 1.0], &payload("a", "m1")).await.unwrap();
        let hits = store.search("v1", &[0.0, 1.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_put_chunk_is_idempotent_by_hash() {
        let store = InMemoryChunkStore::new();
        let first = Chunk::new("v1", "m", "c", "s", 0, "same text");
        let second = Chunk::new("v1", "m", "c", "s", 0, "same text");
        let w1 = store.put_chunk(&first).await.unwrap();
        let w2 = store.put_chunk(&second).await.unwrap();
        assert!(w1.created);
        assert!(!w2.created);
        assert_eq!(w2.chunk_id, first.chunk_id);
        assert_eq!(store.count_chunks("v1").await.unwrap(), 1);

        let other_version = Chunk::new("v2", "m", "c", "s", 0, "same text");
        assert!(store.put_chunk(&other_version).await.unwrap().created);
    }

    #[tokio::test]
    async fn test_get_chunks_skips_unknown_and_other_versions() {
        let store = InMemoryChunkStore::new();
        let c = Chunk::new("v1", "m", "c", "s", 0, "text");
        store.put_chunk(&c).await.unwrap();
        let got = store
            .get_chunks("v1", &[c.chunk_id.clone(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(store.get_chunks("v2", &[c.chunk_id.clone()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_requires_session() {
        let store = InMemorySessionStore::new();
        assert!(store.append_message("nope", &new_message("q")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_appends_serialize() {
        let store = Arc::new(InMemorySessionStore::new());
        store.get_or_create(key("s1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message("s1", &new_message(&format!("q{}", i)))
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.message_count, 20);
        let messages = store.list_messages("s1", 0, 100).await.unwrap();
        let seqs: Vec<i64> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_list_messages_cursor() {
        let store = InMemorySessionStore::new();
        store.get_or_create(key("s1")).await.unwrap();
        for i in 0..5 {
            store.append_message("s1", &new_message(&format!("q{}", i))).await.unwrap();
        }
        let page = store.list_messages("s1", 2, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(page[0].user_text, "q2");
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = InMemorySessionStore::new();
        let a = store.get_or_create(key("s1")).await.unwrap();
        let b = store.get_or_create(key("s1")).await.unwrap();
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(a.session_id, b.session_id);
    }
}
