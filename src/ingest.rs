//! Chunk indexing for pre-chunked book content.
//!
//! Chunking and authoring happen outside this crate. What arrives here is
//! one JSON record per chunk (`module`, `chapter`, `section`,
//! `chunk_index`, `content`). [`Indexer::index_chunk`] embeds the content,
//! upserts the vector under the chunk's UUID, then writes the chunk row.
//!
//! Indexing is idempotent by content hash: a record whose content already
//! exists in the corpus version is skipped without an embedding call. The
//! vector is written before the row, so a crash in between leaves at most
//! an orphan vector, which retrieval ignores.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use book_rag_core::embedding::{embed_one, Embedder};
use book_rag_core::models::Chunk;
use book_rag_core::store::{ChunkStore, VectorPayload, VectorStore};
use book_rag_core::text::content_hash;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::orchestrator::open_vector_store;
use crate::qdrant::QdrantStore;
use crate::sqlite_store::SqliteStore;

/// One line of an ingest file.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkRecord {
    pub module: String,
    pub chapter: String,
    pub section: String,
    pub chunk_index: i64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed { chunk_id: String },
    /// Same content already indexed in this corpus version.
    Unchanged { chunk_id: String },
}

pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    chunks: Arc<dyn ChunkStore>,
    corpus_version: String,
}

impl Indexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        chunks: Arc<dyn ChunkStore>,
        corpus_version: &str,
    ) -> Self {
        Self {
            embedder,
            vectors,
            chunks,
            corpus_version: corpus_version.to_string(),
        }
    }

    pub async fn index_chunk(&self, record: &ChunkRecord) -> Result<IndexOutcome> {
        if record.content.trim().is_empty() {
            bail!("chunk {} has empty content", record.chunk_index);
        }
        let hash = content_hash(&record.content);
        if let Some(existing) = self
            .chunks
            .find_by_hash(&self.corpus_version, &hash)
            .await?
        {
            return Ok(IndexOutcome::Unchanged {
                chunk_id: existing.chunk_id,
            });
        }

        let chunk = Chunk::new(
            &self.corpus_version,
            &record.module,
            &record.chapter,
            &record.section,
            record.chunk_index,
            &record.content,
        );
        let vector = embed_one(self.embedder.as_ref(), &chunk.content).await?;
        self.vectors
            .upsert(
                &self.corpus_version,
                &chunk.embedding_ref,
                &vector,
                &VectorPayload::for_chunk(&chunk),
            )
            .await?;

        let write = self.chunks.put_chunk(&chunk).await?;
        if write.created {
            Ok(IndexOutcome::Indexed {
                chunk_id: write.chunk_id,
            })
        } else {
            Ok(IndexOutcome::Unchanged {
                chunk_id: write.chunk_id,
            })
        }
    }
}

/// Parse a JSONL file of [`ChunkRecord`]s. Blank lines are skipped.
pub fn read_records(path: &Path) -> Result<Vec<ChunkRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read ingest file: {}", path.display()))?;
    parse_records(&content)
}

fn parse_records(content: &str) -> Result<Vec<ChunkRecord>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid chunk record on line {}", i + 1))
        })
        .collect()
}

/// `bookrag ingest`: index every record in `path` into the active corpus.
pub async fn run_ingest(config: &Config, path: &Path, dry_run: bool) -> Result<()> {
    let records = read_records(path)?;

    if dry_run {
        println!("ingest {} (dry-run)", path.display());
        println!("  records: {}", records.len());
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let embedder = create_embedder(&config.embedding)?;
    if config.vector_store.backend == "qdrant" {
        QdrantStore::new(&config.vector_store)?
            .ensure_collection(&config.corpus.version, embedder.dims())
            .await?;
    }

    let store = SqliteStore::new(db::connect(config).await?);
    let indexer = Indexer::new(
        embedder,
        open_vector_store(config, &store)?,
        Arc::new(store.clone()),
        &config.corpus.version,
    );

    let mut indexed = 0u64;
    let mut unchanged = 0u64;
    let mut failed = 0u64;
    for record in &records {
        match indexer.index_chunk(record).await {
            Ok(IndexOutcome::Indexed { .. }) => indexed += 1,
            Ok(IndexOutcome::Unchanged { .. }) => unchanged += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(
                    chunk_index = record.chunk_index,
                    error = %format!("{:#}", e),
                    "failed to index chunk"
                );
            }
        }
    }

    println!("ingest {}", path.display());
    println!("  corpus version: {}", config.corpus.version);
    println!("  records: {}", records.len());
    println!("  indexed: {}", indexed);
    println!("  unchanged: {}", unchanged);
    if failed > 0 {
        println!("  failed: {}", failed);
    }
    println!("ok");

    store.pool().close().await;
    Ok(())
}
