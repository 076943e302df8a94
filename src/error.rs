//! Typed errors at the pipeline boundary.
//!
//! Stores and providers return `anyhow::Result`. The orchestrator converts
//! their failures into [`QueryError`], whose variants are what callers see:
//! the HTTP layer maps each one to a status code and the JSON error body
//! `{error_kind, message, retry_after?}`.
//!
//! A validation failure in selected-text mode is not an error. It comes
//! back as a refused answer.

use std::time::Duration;

use book_rag_core::ratelimit::Scope;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// Empty or oversized query or selection. Never reaches a provider.
    #[error("{0}")]
    InvalidInput(String),

    /// Admission denied by the rate limiter.
    #[error("{}", rate_limit_message(*scope, *retry_after))]
    RateLimited { scope: Scope, retry_after: Duration },

    /// Embedding or vector search failed after the retry.
    #[error("Retrieval is temporarily unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Every generation provider failed or timed out.
    #[error("Answer generation is temporarily unavailable: {0}")]
    GenerationUnavailable(String),

    /// A session or message read/write failed.
    #[error("Session storage failed: {0}")]
    PersistenceFailed(String),

    #[error("Session not found: {0}")]
    NotFound(String),
}

impl QueryError {
    /// Stable machine-readable kind, used as `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::InvalidInput(_) => "invalid_input",
            QueryError::RateLimited { .. } => "rate_limited",
            QueryError::RetrievalUnavailable(_) => "retrieval_unavailable",
            QueryError::GenerationUnavailable(_) => "generation_unavailable",
            QueryError::PersistenceFailed(_) => "persistence_failed",
            QueryError::NotFound(_) => "not_found",
        }
    }

    /// Whole seconds until the caller may retry, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            QueryError::RateLimited { retry_after, .. } => Some(ceil_secs(*retry_after)),
            _ => None,
        }
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        QueryError::PersistenceFailed(format!("{:#}", err))
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

fn rate_limit_message(scope: Scope, retry_after: Duration) -> String {
    let what = match scope {
        Scope::Session => "too many questions in this session",
        Scope::Client => "daily request limit reached for this client",
    };
    format!(
        "Rate limit exceeded: {}. Try again in {} seconds.",
        what,
        ceil_secs(retry_after)
    )
}
