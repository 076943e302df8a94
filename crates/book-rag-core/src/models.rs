//! Core data models that flow through the query pipeline.
//!
//! Chunks are written by ingestion and only read here. Sessions and
//! messages are owned by the session store. [`RetrievedCandidate`] and
//! [`Answer`] are ephemeral and live for a single query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text::{content_hash, excerpt};

/// A passage of the book, as produced by ingestion.
///
/// Chunks are immutable. A new corpus version gets its own namespace
/// instead of rewriting rows in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub corpus_version: String,
    pub module: String,
    pub chapter: String,
    pub section: String,
    /// Position within the book; lower comes first.
    pub chunk_index: i64,
    pub content: String,
    /// SHA-256 hex of `content`.
    pub content_hash: String,
    /// Point id in the vector store.
    pub embedding_ref: String,
}

impl Chunk {
    /// Build a chunk with a fresh UUID and a computed content hash.
    ///
    /// The UUID doubles as the vector-store point id, which is why
    /// `embedding_ref` starts out equal to `chunk_id`.
    pub fn new(
        corpus_version: &str,
        module: &str,
        chapter: &str,
        section: &str,
        chunk_index: i64,
        content: &str,
    ) -> Self {
        let chunk_id = uuid::Uuid::new_v4().to_string();
        Self {
            embedding_ref: chunk_id.clone(),
            chunk_id,
            corpus_version: corpus_version.to_string(),
            module: module.to_string(),
            chapter: chapter.to_string(),
            section: section.to_string(),
            chunk_index,
            content_hash: content_hash(content),
            content: content.to_string(),
        }
    }
}

/// Store-side metadata predicate for retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.module.is_none() && self.chapter.is_none()
    }

    /// True when every set field equals the chunk's metadata.
    pub fn matches(&self, module: &str, chapter: &str) -> bool {
        self.module.as_deref().map_or(true, |m| m == module)
            && self.chapter.as_deref().map_or(true, |c| c == chapter)
    }
}

/// A chunk that came back from retrieval, with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedCandidate {
    pub chunk_id: String,
    /// Cosine similarity in `[-1.0, 1.0]`; higher is more relevant.
    pub score: f64,
    pub module: String,
    pub chapter: String,
    pub section: String,
    pub chunk_index: i64,
    /// Full chunk text. Trimmed down to an excerpt only when cited.
    pub excerpt: String,
}

impl RetrievedCandidate {
    pub fn from_chunk(chunk: &Chunk, score: f64) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            score,
            module: chunk.module.clone(),
            chapter: chunk.chapter.clone(),
            section: chunk.section.clone(),
            chunk_index: chunk.chunk_index,
            excerpt: chunk.content.clone(),
        }
    }

    /// Citation for this candidate with the excerpt cut to `max_chars`.
    pub fn to_source_ref(&self, max_chars: usize) -> SourceRef {
        SourceRef {
            chunk_id: self.chunk_id.clone(),
            excerpt: excerpt(&self.excerpt, max_chars),
        }
    }
}

/// A citation persisted with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub excerpt: String,
}

/// Which context a query was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    FullCorpus,
    SelectedText,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::FullCorpus => "full_corpus",
            Mode::SelectedText => "selected_text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full_corpus" => Some(Mode::FullCorpus),
            "selected_text" => Some(Mode::SelectedText),
            _ => None,
        }
    }
}

/// A conversation container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: Option<String>,
    pub corpus_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

/// One completed query turn, refusals included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub message_id: String,
    pub session_id: String,
    /// 1-based position within the session.
    pub seq: i64,
    pub user_text: String,
    pub assistant_text: String,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
    pub source_refs: Vec<SourceRef>,
    /// `grounded` for full-corpus turns, `in_selected_text` for selections.
    pub grounded: bool,
    pub latency_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Message fields supplied by the caller; the store assigns id, seq and time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub user_text: String,
    pub assistant_text: String,
    pub mode: Mode,
    pub selected_text: Option<String>,
    pub source_refs: Vec<SourceRef>,
    pub grounded: bool,
    pub latency_ms: i64,
}

/// Why an answer was withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    /// Nothing in the corpus cleared the relevance floor.
    NoContext,
    /// The answer could not be attributed to the selected text.
    NotInSelection,
    /// The model replied with the refusal sentence itself.
    ModelDeclined,
}

/// Outcome of generation, with citations carried structurally.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Grounded { text: String, refs: Vec<SourceRef> },
    Refused { reason: RefusalReason, text: String },
}

impl Answer {
    pub fn text(&self) -> &str {
        match self {
            Answer::Grounded { text, .. } | Answer::Refused { text, .. } => text,
        }
    }

    pub fn refs(&self) -> &[SourceRef] {
        match self {
            Answer::Grounded { refs, .. } => refs,
            Answer::Refused { .. } => &[],
        }
    }

    pub fn is_grounded(&self) -> bool {
        matches!(self, Answer::Grounded { .. })
    }

    pub fn refusal_reason(&self) -> Option<RefusalReason> {
        match self {
            Answer::Grounded { .. } => None,
            Answer::Refused { reason, .. } => Some(*reason),
        }
    }
}
