//! SQLite-backed store implementations.
//!
//! [`SqliteStore`] wraps one [`SqlitePool`] and implements all three store
//! traits from `book_rag_core::store` against the schema created by
//! [`crate::migrate`]. Vector search here is brute-force cosine over the
//! `chunk_vectors` rows of one namespace, with the metadata filter pushed
//! into the `WHERE` clause.
//!
//! Timestamps are stored as Unix milliseconds.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use book_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use book_rag_core::models::{
    Chunk, MetadataFilter, Message, Mode, NewMessage, Session, SourceRef,
};
use book_rag_core::store::{
    ChunkStore, ChunkWrite, SessionKey, SessionStore, VectorHit, VectorPayload, VectorStore,
};

/// SQLite implementation of the vector, chunk, and session stores.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    Chunk {
        chunk_id: row.get("chunk_id"),
        corpus_version: row.get("corpus_version"),
        module: row.get("module"),
        chapter: row.get("chapter"),
        section: row.get("section"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        embedding_ref: row.get("embedding_ref"),
    }
}

fn row_to_session(row: &SqliteRow) -> Session {
    Session {
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        corpus_version: row.get("corpus_version"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        message_count: row.get("message_count"),
    }
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let mode: String = row.get("mode");
    let refs_json: String = row.get("source_refs_json");
    let source_refs: Vec<SourceRef> =
        serde_json::from_str(&refs_json).context("Corrupt source_refs_json")?;
    let grounded: i64 = row.get("grounded");
    Ok(Message {
        message_id: row.get("message_id"),
        session_id: row.get("session_id"),
        seq: row.get("seq"),
        user_text: row.get("user_text"),
        assistant_text: row.get("assistant_text"),
        mode: Mode::parse(&mode).with_context(|| format!("Unknown message mode: {}", mode))?,
        selected_text: row.get("selected_text"),
        source_refs,
        grounded: grounded != 0,
        latency_ms: row.get("latency_ms"),
        created_at: from_millis(row.get("created_at")),
    })
}

const CHUNK_COLUMNS: &str = "chunk_id, corpus_version, module, chapter, section, chunk_index, \
                             content, content_hash, embedding_ref";

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        vector: &[f32],
        payload: &VectorPayload,
    ) -> Result<()> {
        let blob = vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (namespace, point_id, chunk_id, module, chapter,
                                       section, chunk_index, dims, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, point_id) DO UPDATE SET
                chunk_id = excluded.chunk_id,
                module = excluded.module,
                chapter = excluded.chapter,
                section = excluded.section,
                chunk_index = excluded.chunk_index,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(namespace)
        .bind(id)
        .bind(&payload.chunk_id)
        .bind(&payload.module)
        .bind(&payload.chapter)
        .bind(&payload.section)
        .bind(payload.chunk_index)
        .bind(vector.len() as i64)
        .bind(&blob)
        .execute(&self.pool)
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
        let module = filter.and_then(|f| f.module.as_deref());
        let chapter = filter.and_then(|f| f.chapter.as_deref());

        let rows = sqlx::query(
            r#"
            SELECT point_id, chunk_id, module, chapter, section, chunk_index, embedding
            FROM chunk_vectors
            WHERE namespace = ?
              AND (? IS NULL OR module = ?)
              AND (? IS NULL OR chapter = ?)
            "#,
        )
        .bind(namespace)
        .bind(module)
        .bind(module)
        .bind(chapter)
        .bind(chapter)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(vector, &blob_to_vec(&blob)) as f64;
                VectorHit {
                    id: row.get("point_id"),
                    score: similarity,
                    payload: VectorPayload {
                        chunk_id: row.get("chunk_id"),
                        module: row.get("module"),
                        chapter: row.get("chapter"),
                        section: row.get("section"),
                        chunk_index: row.get("chunk_index"),
                    },
                }
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

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn put_chunk(&self, chunk: &Chunk) -> Result<ChunkWrite> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO chunks (chunk_id, corpus_version, module, chapter, section,
                                chunk_index, content, content_hash, embedding_ref, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(corpus_version, content_hash) DO NOTHING
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.corpus_version)
        .bind(&chunk.module)
        .bind(&chunk.chapter)
        .bind(&chunk.section)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(&chunk.content_hash)
        .bind(&chunk.embedding_ref)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ChunkWrite {
                chunk_id: chunk.chunk_id.clone(),
                created: true,
            });
        }

        let existing: String = sqlx::query_scalar(
            "SELECT chunk_id FROM chunks WHERE corpus_version = ? AND content_hash = ?",
        )
        .bind(&chunk.corpus_version)
        .bind(&chunk.content_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(ChunkWrite {
            chunk_id: existing,
            created: false,
        })
    }

    async fn get_chunks(&self, corpus_version: &str, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM chunks WHERE corpus_version = ? AND chunk_id IN ({})",
            CHUNK_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql).bind(corpus_version);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn find_by_hash(
        &self,
        corpus_version: &str,
        content_hash: &str,
    ) -> Result<Option<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE corpus_version = ? AND content_hash = ?",
            CHUNK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(corpus_version)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_chunk))
    }

    async fn count_chunks(&self, corpus_version: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE corpus_version = ?")
            .bind(corpus_version)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get_or_create(&self, key: SessionKey<'_>) -> Result<Session> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, corpus_version, created_at, updated_at, message_count)
            VALUES (?, ?, ?, ?, ?, 0)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(key.session_id)
        .bind(key.user_id)
        .bind(key.corpus_version)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        match self.get_session(key.session_id).await? {
            Some(session) => Ok(session),
            None => bail!("Session vanished after insert: {}", key.session_id),
        }
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, user_id, corpus_version, created_at, updated_at, message_count
            FROM sessions WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_session))
    }

    async fn append_message(&self, session_id: &str, message: &NewMessage) -> Result<Message> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let message_id = uuid::Uuid::new_v4().to_string();
        let refs_json = serde_json::to_string(&message.source_refs)?;

        // The UPDATE takes the write lock first, so concurrent appends on
        // the same session queue here and each sees the previous count.
        let mut tx = self.pool.begin().await?;

        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET message_count = message_count + 1, updated_at = ?
            WHERE session_id = ?
            RETURNING message_count
            "#,
        )
        .bind(now_ms)
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(seq) = seq else {
            bail!("Session not found: {}", session_id);
        };

        sqlx::query(
            r#"
            INSERT INTO messages (message_id, session_id, seq, user_text, assistant_text, mode,
                                  selected_text, source_refs_json, grounded, latency_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message_id)
        .bind(session_id)
        .bind(seq)
        .bind(&message.user_text)
        .bind(&message.assistant_text)
        .bind(message.mode.as_str())
        .bind(&message.selected_text)
        .bind(&refs_json)
        .bind(message.grounded as i64)
        .bind(message.latency_ms)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Message {
            message_id,
            session_id: session_id.to_string(),
            seq,
            user_text: message.user_text.clone(),
            assistant_text: message.assistant_text.clone(),
            mode: message.mode,
            selected_text: message.selected_text.clone(),
            source_refs: message.source_refs.clone(),
            grounded: message.grounded,
            latency_ms: message.latency_ms,
            created_at: from_millis(now_ms),
        })
    }

    async fn list_messages(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, session_id, seq, user_text, assistant_text, mode, selected_text,
                   source_refs_json, grounded, latency_ms, created_at
            FROM messages
            WHERE session_id = ? AND seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(after_seq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }
}
