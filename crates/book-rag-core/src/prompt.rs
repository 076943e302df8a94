//! Prompt templates and fixed refusal texts.
//!
//! The system instruction forbids answering from outside knowledge and
//! makes the model reply with an exact refusal sentence when the context
//! is insufficient. [`is_model_refusal`] recognizes that sentence so the
//! caller can turn it into a structured refusal.

use crate::models::Mode;

/// Returned when retrieval finds nothing above the relevance floor.
pub const NO_CONTEXT_REFUSAL: &str =
    "I couldn't find relevant information in the book to answer your question.";

/// Returned when the answer cannot be attributed to the selected text.
pub const SELECTION_REFUSAL: &str =
    "The selected text does not contain the answer to your question.";

const FULL_CORPUS_SYSTEM: &str = "\
You are a teaching assistant for a technical book. Answer the user's question \
using ONLY the numbered sources in the provided context. Do not use outside \
knowledge, do not speculate, and do not invent facts, figures, or citations. \
Refer to sources by their number, for example [Source 2], when you use them. \
Keep the answer concise and technically precise.";

const SELECTED_TEXT_SYSTEM: &str = "\
You are a teaching assistant for a technical book. The user has selected a \
passage and asks a question about it. Answer using ONLY the selected text. \
Do not use the rest of the book or outside knowledge, and do not speculate \
beyond what the passage states.";

/// System instruction for `mode`, ending with the exact refusal sentence.
pub fn system_prompt(mode: Mode) -> String {
    let (base, refusal) = match mode {
        Mode::FullCorpus => (FULL_CORPUS_SYSTEM, NO_CONTEXT_REFUSAL),
        Mode::SelectedText => (SELECTED_TEXT_SYSTEM, SELECTION_REFUSAL),
    };
    format!(
        "{}\n\nIf the {} does not contain the answer, reply with exactly this sentence and nothing else:\n{}",
        base,
        match mode {
            Mode::FullCorpus => "context",
            Mode::SelectedText => "selected text",
        },
        refusal
    )
}

/// User instruction embedding the context block and the question.
pub fn user_prompt(mode: Mode, context_block: &str, query: &str) -> String {
    match mode {
        Mode::FullCorpus => format!(
            "Context:\n{}\n\nQuestion: {}\n\nAnswer:",
            context_block, query
        ),
        Mode::SelectedText => format!(
            "Selected text:\n\"\"\"\n{}\n\"\"\"\n\nQuestion: {}\n\nAnswer:",
            context_block, query
        ),
    }
}

/// The refusal sentence for `mode`.
pub fn refusal_text(mode: Mode) -> &'static str {
    match mode {
        Mode::FullCorpus => NO_CONTEXT_REFUSAL,
        Mode::SelectedText => SELECTION_REFUSAL,
    }
}

/// True when the model answered with the refusal sentence for `mode`.
///
/// Matching ignores surrounding whitespace, quotes, and ASCII case so that
/// minor formatting drift still counts.
pub fn is_model_refusal(mode: Mode, answer: &str) -> bool {
    let cleaned = answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace());
    cleaned.eq_ignore_ascii_case(refusal_text(mode))
        || cleaned
            .trim_end_matches('.')
            .eq_ignore_ascii_case(refusal_text(mode).trim_end_matches('.'))
}
