//! Selected-text validation.
//!
//! A selected-text answer is accepted only when its embedding is close
//! enough to the selection's embedding. Anything else, including an
//! embedding failure, replaces the answer with [`SELECTION_REFUSAL`]: the
//! check fails closed.
//!
//! Rejections are logged at `warn` under the `book_rag::validation` target
//! so they can be monitored separately from the request log.

use std::sync::Arc;
use std::time::Duration;

use book_rag_core::embedding::{cosine_similarity, Embedder};
use book_rag_core::models::{Answer, RefusalReason};
use book_rag_core::prompt::SELECTION_REFUSAL;
use book_rag_core::text::truncate_to_tokens;

use crate::config::SelectionConfig;
use crate::error::QueryError;
use crate::retrieval::with_timeout;

/// Selection text ready for prompting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSelection {
    pub text: String,
    pub truncated: bool,
}

/// Reject empty or oversized selections, then cut to the token budget.
pub fn prepare_selection(
    selected_text: &str,
    config: &SelectionConfig,
) -> Result<PreparedSelection, QueryError> {
    let trimmed = selected_text.trim();
    if trimmed.is_empty() {
        return Err(QueryError::InvalidInput(
            "selected_text must not be empty".to_string(),
        ));
    }
    let chars = trimmed.chars().count();
    if chars > config.max_chars {
        return Err(QueryError::InvalidInput(format!(
            "selected_text is {} characters; the maximum is {}",
            chars, config.max_chars
        )));
    }
    let (cut, truncated) = truncate_to_tokens(trimmed, config.max_tokens);
    Ok(PreparedSelection {
        text: cut.to_string(),
        truncated,
    })
}

/// Result of comparing an answer with its selection.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Supported { score: f32 },
    Unsupported { score: f32 },
    /// The comparison itself failed.
    Unverifiable(String),
}

impl Verdict {
    pub fn is_supported(&self) -> bool {
        matches!(self, Verdict::Supported { .. })
    }
}

pub struct Validator {
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    timeout: Duration,
}

impl Validator {
    pub fn new(embedder: Arc<dyn Embedder>, threshold: f32, timeout: Duration) -> Self {
        Self {
            embedder,
            threshold,
            timeout,
        }
    }

    /// Similarity of `answer` to `selection` against the threshold.
    pub async fn verdict(&self, answer: &str, selection: &str) -> Verdict {
        let texts = vec![answer.to_string(), selection.to_string()];
        let vectors = match with_timeout(
            "validation embedding",
            self.timeout,
            self.embedder.embed(&texts),
        )
        .await
        {
            Ok(v) if v.len() == 2 => v,
            Ok(v) => return Verdict::Unverifiable(format!("expected 2 embeddings, got {}", v.len())),
            Err(e) => return Verdict::Unverifiable(format!("{:#}", e)),
        };
        let score = cosine_similarity(&vectors[0], &vectors[1]);
        if score >= self.threshold {
            Verdict::Supported { score }
        } else {
            Verdict::Unsupported { score }
        }
    }

    /// Pass a supported answer through; refuse everything else.
    ///
    /// Answers that are already refusals are returned unchanged without an
    /// embedding call.
    pub async fn enforce(&self, answer: Answer, selection: &str) -> Answer {
        if !answer.is_grounded() {
            return answer;
        }
        match self.verdict(answer.text(), selection).await {
            Verdict::Supported { score } => {
                tracing::debug!(score, "answer supported by selection");
                answer
            }
            Verdict::Unsupported { score } => {
                tracing::warn!(
                    target: "book_rag::validation",
                    score,
                    threshold = self.threshold,
                    "answer not supported by selected text"
                );
                refused()
            }
            Verdict::Unverifiable(reason) => {
                tracing::warn!(
                    target: "book_rag::validation",
                    %reason,
                    "selection validation failed, refusing"
                );
                refused()
            }
        }
    }
}

fn refused() -> Answer {
    Answer::Refused {
        reason: RefusalReason::NotInSelection,
        text: SELECTION_REFUSAL.to_string(),
    }
}
