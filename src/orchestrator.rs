//! Query orchestration.
//!
//! Drives one request through the pipeline and owns the request-level
//! concerns: input validation, admission, latency, logging, and
//! persistence of the finished turn.
//!
//! # States
//!
//! ```text
//! Received → RateChecked → Retrieving ──→ Generating ──────────────→ Persisting → Completed
//!                        └→ SelectionOnly → Generating → Validating ┘            └→ Refused
//! ```
//!
//! `Errored` is reachable from every state. Refused turns are persisted like
//! any other before reaching the `Refused` terminal. Every transition is
//! logged at `debug` inside a span carrying the request id.
//!
//! Input and rate-limit failures return before any provider is called. A
//! persistence failure after generation is logged at `error` and the answer
//! is still returned.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use book_rag_core::embedding::Embedder;
use book_rag_core::models::{MetadataFilter, Mode, NewMessage, RefusalReason, SourceRef};
use book_rag_core::rank::{augment, AugmentParams};
use book_rag_core::ratelimit::{Admission, Clock, CounterStore, RateLimiter, SystemClock};
use book_rag_core::store::{ChunkStore, SessionStore, VectorStore};

use crate::config::{Config, RetrievalConfig, SelectionConfig};
use crate::db;
use crate::embedding::create_embedder;
use crate::error::QueryError;
use crate::generation::{create_providers, CompletionProvider, Generated, Generator};
use crate::qdrant::QdrantStore;
use crate::retrieval::{Retriever, RetrieverSettings};
use crate::session::{HistoryPage, SessionManager};
use crate::sqlite_store::SqliteStore;
use crate::validator::{prepare_selection, Validator};

// ============ Request / response types ============

/// Body of `POST /query`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub filter: Option<MetadataFilter>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

/// Body of `POST /query/selection`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectionRequest {
    pub query: String,
    pub selected_text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub source_refs: Vec<SourceRef>,
    pub session_id: String,
    pub latency_ms: u64,
    pub grounded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal_reason: Option<RefusalReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionResponse {
    pub answer: String,
    pub in_selected_text: bool,
    pub session_id: String,
    pub selection_truncated: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal_reason: Option<RefusalReason>,
}

fn token_usage(generated: &Generated) -> Option<TokenUsage> {
    if generated.input_tokens.is_none() && generated.output_tokens.is_none() {
        return None;
    }
    Some(TokenUsage {
        input: generated.input_tokens,
        output: generated.output_tokens,
    })
}

// ============ State logging ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Received,
    RateChecked,
    Retrieving,
    SelectionOnly,
    Generating,
    Validating,
    Persisting,
    Completed,
    Refused,
    Errored,
}

impl QueryState {
    fn as_str(&self) -> &'static str {
        match self {
            QueryState::Received => "received",
            QueryState::RateChecked => "rate_checked",
            QueryState::Retrieving => "retrieving",
            QueryState::SelectionOnly => "selection_only",
            QueryState::Generating => "generating",
            QueryState::Validating => "validating",
            QueryState::Persisting => "persisting",
            QueryState::Completed => "completed",
            QueryState::Refused => "refused",
            QueryState::Errored => "errored",
        }
    }
}

fn enter(state: QueryState) {
    tracing::debug!(state = state.as_str(), "query state");
}

fn log_failure(err: &QueryError) {
    enter(QueryState::Errored);
    match err {
        QueryError::InvalidInput(_) | QueryError::RateLimited { .. } | QueryError::NotFound(_) => {
            tracing::info!(error_kind = err.kind(), %err, "query rejected")
        }
        _ => tracing::warn!(error_kind = err.kind(), %err, "query failed"),
    }
}

fn validate_query(query: &str, max_chars: usize) -> Result<&str, QueryError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(QueryError::InvalidInput("query must not be empty".to_string()));
    }
    let chars = query.chars().count();
    if chars > max_chars {
        return Err(QueryError::InvalidInput(format!(
            "query is {} characters; the maximum is {}",
            chars, max_chars
        )));
    }
    Ok(query)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ============ Wiring ============

/// Everything the orchestrator talks to.
pub struct Components {
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorStore>,
    pub chunks: Arc<dyn ChunkStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub providers: Vec<Arc<dyn CompletionProvider>>,
    pub clock: Arc<dyn Clock>,
    pub counters: Arc<dyn CounterStore>,
}

impl Components {
    /// Production wiring: SQLite for chunks and sessions, the configured
    /// vector backend, and HTTP providers.
    ///
    /// The schema must already exist (`bookrag init`). An `[embedding]`
    /// provider is required: without one no question can be answered.
    pub async fn from_config(config: &Config, counters: Arc<dyn CounterStore>) -> Result<Self> {
        if !config.embedding.is_enabled() {
            bail!(
                "Embedding provider is disabled. Set [embedding] provider, model and dims \
                 in config to answer questions."
            );
        }
        let store = SqliteStore::new(db::connect(config).await?);
        Ok(Self {
            embedder: create_embedder(&config.embedding)?,
            vectors: open_vector_store(config, &store)?,
            chunks: Arc::new(store.clone()),
            sessions: Arc::new(store),
            providers: create_providers(&config.generation)?,
            clock: Arc::new(SystemClock),
            counters,
        })
    }
}

/// The vector store named by `[vector_store].backend`.
pub fn open_vector_store(config: &Config, store: &SqliteStore) -> Result<Arc<dyn VectorStore>> {
    match config.vector_store.backend.as_str() {
        "qdrant" => Ok(Arc::new(QdrantStore::new(&config.vector_store)?)),
        _ => Ok(Arc::new(store.clone())),
    }
}

// ============ Orchestrator ============

pub struct Orchestrator {
    retriever: Retriever,
    generator: Generator,
    validator: Validator,
    sessions: SessionManager,
    limiter: RateLimiter,
    retrieval: RetrievalConfig,
    augment: AugmentParams,
    selection: SelectionConfig,
    corpus_version: String,
}

impl Orchestrator {
    pub fn new(config: &Config, components: Components) -> Self {
        let Components {
            embedder,
            vectors,
            chunks,
            sessions,
            providers,
            clock,
            counters,
        } = components;

        let retriever = Retriever::new(
            embedder.clone(),
            vectors,
            chunks,
            RetrieverSettings {
                corpus_version: config.corpus.version.clone(),
                floor: config.retrieval.min_similarity,
                embed_timeout: config.embedding.timeout(),
                search_timeout: config.vector_store.timeout(),
                retry_backoff: config.retrieval.retry_backoff(),
            },
        );

        Self {
            retriever,
            generator: Generator::new(
                providers,
                &config.generation,
                config.retrieval.excerpt_chars,
            ),
            validator: Validator::new(
                embedder,
                config.selection.threshold,
                config.embedding.timeout(),
            ),
            sessions: SessionManager::new(sessions, &config.corpus.version, &config.sessions),
            limiter: RateLimiter::new(
                clock,
                counters,
                config.rate_limit.session_rule(),
                config.rate_limit.client_rule(),
            ),
            retrieval: config.retrieval.clone(),
            augment: config.augment_params(),
            selection: config.selection.clone(),
            corpus_version: config.corpus.version.clone(),
        }
    }

    pub fn corpus_version(&self) -> &str {
        &self.corpus_version
    }

    /// Answer a question from the whole corpus.
    pub async fn query(
        &self,
        req: QueryRequest,
        client_addr: &str,
    ) -> Result<QueryResponse, QueryError> {
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("query", %request_id, mode = Mode::FullCorpus.as_str());
        async move {
            let out = self.full_corpus(req, client_addr, Instant::now()).await;
            if let Err(e) = &out {
                log_failure(e);
            }
            out
        }
        .instrument(span)
        .await
    }

    /// Answer a question from the selected text only.
    pub async fn query_selected_text(
        &self,
        req: SelectionRequest,
        client_addr: &str,
    ) -> Result<SelectionResponse, QueryError> {
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("query", %request_id, mode = Mode::SelectedText.as_str());
        async move {
            let out = self.selected_text(req, client_addr, Instant::now()).await;
            if let Err(e) = &out {
                log_failure(e);
            }
            out
        }
        .instrument(span)
        .await
    }

    pub async fn get_history(
        &self,
        session_id: &str,
        limit: Option<usize>,
        after: Option<i64>,
    ) -> Result<HistoryPage, QueryError> {
        self.sessions.history(session_id, limit, after).await
    }

    async fn admit(&self, session_id: &str, client_addr: &str) -> Result<(), QueryError> {
        match self.limiter.admit_query(session_id, client_addr).await {
            Ok(Admission::Admitted) => Ok(()),
            Ok(Admission::Rejected { scope, retry_after }) => {
                Err(QueryError::RateLimited { scope, retry_after })
            }
            Err(e) => {
                // Counters are best-effort; a broken counter store admits.
                tracing::warn!(error = %format!("{:#}", e), "rate limiter unavailable, admitting");
                Ok(())
            }
        }
    }

    async fn persist(&self, session_id: &str, user_id: Option<&str>, message: NewMessage) {
        enter(QueryState::Persisting);
        if let Err(e) = self.sessions.record(session_id, user_id, &message).await {
            tracing::error!(
                %session_id,
                error = %e,
                "failed to persist message, answer returned without history"
            );
        }
    }

    async fn full_corpus(
        &self,
        req: QueryRequest,
        client_addr: &str,
        started: Instant,
    ) -> Result<QueryResponse, QueryError> {
        enter(QueryState::Received);
        let query = validate_query(&req.query, self.retrieval.max_query_chars)?;
        let session_id = self.sessions.resolve_id(req.session_id.as_deref())?;
        self.admit(&session_id, client_addr).await?;
        enter(QueryState::RateChecked);

        enter(QueryState::Retrieving);
        let k = self.retrieval.effective_k(req.top_k);
        let candidates = self
            .retriever
            .retrieve(query, k, req.filter.as_ref())
            .await?;
        let retrieved = candidates.len();
        let augmented = augment(candidates, &self.augment);

        enter(QueryState::Generating);
        let generated = self
            .generator
            .generate(query, &augmented.context_block, Mode::FullCorpus, &augmented.used)
            .await?;
        let answer = &generated.answer;
        let grounded = answer.is_grounded();

        let latency_ms = elapsed_ms(started);
        self.persist(
            &session_id,
            req.user_id.as_deref(),
            NewMessage {
                user_text: query.to_string(),
                assistant_text: answer.text().to_string(),
                mode: Mode::FullCorpus,
                selected_text: None,
                source_refs: answer.refs().to_vec(),
                grounded,
                latency_ms: latency_ms as i64,
            },
        )
        .await;

        enter(if grounded {
            QueryState::Completed
        } else {
            QueryState::Refused
        });
        tracing::info!(
            %session_id,
            retrieved,
            cited = answer.refs().len(),
            grounded,
            latency_ms,
            "query answered"
        );

        Ok(QueryResponse {
            answer: answer.text().to_string(),
            source_refs: answer.refs().to_vec(),
            session_id,
            latency_ms,
            grounded,
            model: generated.model.clone(),
            tokens: token_usage(&generated),
            refusal_reason: answer.refusal_reason(),
        })
    }

    async fn selected_text(
        &self,
        req: SelectionRequest,
        client_addr: &str,
        started: Instant,
    ) -> Result<SelectionResponse, QueryError> {
        enter(QueryState::Received);
        let query = validate_query(&req.query, self.retrieval.max_query_chars)?;
        let selection = prepare_selection(&req.selected_text, &self.selection)?;
        let session_id = self.sessions.resolve_id(req.session_id.as_deref())?;
        self.admit(&session_id, client_addr).await?;
        enter(QueryState::RateChecked);

        enter(QueryState::SelectionOnly);
        if selection.truncated {
            tracing::debug!(chars = selection.text.len(), "selection truncated");
        }

        enter(QueryState::Generating);
        let generated = self
            .generator
            .generate(query, &selection.text, Mode::SelectedText, &[])
            .await?;

        let answer = if generated.answer.is_grounded() {
            enter(QueryState::Validating);
            self.validator
                .enforce(generated.answer.clone(), &selection.text)
                .await
        } else {
            generated.answer.clone()
        };
        let in_selected_text = answer.is_grounded();

        let latency_ms = elapsed_ms(started);
        self.persist(
            &session_id,
            req.user_id.as_deref(),
            NewMessage {
                user_text: query.to_string(),
                assistant_text: answer.text().to_string(),
                mode: Mode::SelectedText,
                selected_text: Some(selection.text.clone()),
                source_refs: Vec::new(),
                grounded: in_selected_text,
                latency_ms: latency_ms as i64,
            },
        )
        .await;

        enter(if in_selected_text {
            QueryState::Completed
        } else {
            QueryState::Refused
        });
        tracing::info!(%session_id, in_selected_text, latency_ms, "selection query answered");

        Ok(SelectionResponse {
            answer: answer.text().to_string(),
            in_selected_text,
            session_id,
            selection_truncated: selection.truncated,
            latency_ms,
            model: generated.model,
            refusal_reason: answer.refusal_reason(),
        })
    }
}
