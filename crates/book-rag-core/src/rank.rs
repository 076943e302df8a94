//! Relevance ranking and context packing.
//!
//! Turns retrieved candidates into the bounded context block handed to the
//! generation step.
//!
//! # Algorithm
//!
//! 1. Drop candidates whose score is below `floor`.
//! 2. Sort by score (desc), then by the configured tie-break: book order
//!    (`chunk_index` asc, then `chunk_id` asc) or `chunk_id` asc alone.
//! 3. Greedily append `[Source N: module > chapter > section]` entries
//!    while the estimated token count stays within `budget_tokens`. An
//!    entry that does not fit is skipped and packing continues. When the
//!    block is still empty and the entry is too large on its own, its
//!    content is truncated at a word boundary to fill the budget.
//!
//! The output depends only on the input candidates and parameters.

use serde::Deserialize;

use crate::models::RetrievedCandidate;
use crate::text::{truncate_to_tokens, CHARS_PER_TOKEN};

const ENTRY_SEPARATOR: &str = "\n\n";

/// Secondary ordering applied to equal scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Earlier sections of the book first, then chunk id.
    #[default]
    BookOrder,
    /// Chunk id only.
    ChunkId,
}

/// Packing parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct AugmentParams {
    /// Minimum similarity a candidate needs to be considered.
    pub floor: f64,
    /// Upper bound on the estimated size of the context block.
    pub budget_tokens: usize,
    pub tie_break: TieBreak,
}

impl Default for AugmentParams {
    fn default() -> Self {
        Self {
            floor: 0.7,
            budget_tokens: 3000,
            tie_break: TieBreak::BookOrder,
        }
    }
}

/// The packed context and the candidates that made it in, in citation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Augmented {
    pub context_block: String,
    pub used: Vec<RetrievedCandidate>,
}

impl Augmented {
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

/// Keep only candidates scoring at least `floor`.
pub fn apply_floor(candidates: Vec<RetrievedCandidate>, floor: f64) -> Vec<RetrievedCandidate> {
    candidates.into_iter().filter(|c| c.score >= floor).collect()
}

/// Sort candidates into composite relevance order.
pub fn order_candidates(candidates: &mut [RetrievedCandidate], tie_break: TieBreak) {
    candidates.sort_by(|a, b| {
        let by_score = b
            .score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal);
        match tie_break {
            TieBreak::BookOrder => by_score
                .then(a.chunk_index.cmp(&b.chunk_index))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id)),
            TieBreak::ChunkId => by_score.then_with(|| a.chunk_id.cmp(&b.chunk_id)),
        }
    });
}

fn source_header(n: usize, c: &RetrievedCandidate) -> String {
    format!("[Source {}: {} > {} > {}]", n, c.module, c.chapter, c.section)
}

/// Filter, order, and pack candidates into a context block.
pub fn augment(candidates: Vec<RetrievedCandidate>, params: &AugmentParams) -> Augmented {
    let mut ranked = apply_floor(candidates, params.floor);
    order_candidates(&mut ranked, params.tie_break);

    let budget_bytes = params.budget_tokens * CHARS_PER_TOKEN;
    let mut block = String::new();
    let mut used: Vec<RetrievedCandidate> = Vec::new();

    for cand in ranked {
        let header = source_header(used.len() + 1, &cand);
        let sep_len = if block.is_empty() { 0 } else { ENTRY_SEPARATOR.len() };
        let entry_len = header.len() + 1 + cand.excerpt.len();

        if block.len() + sep_len + entry_len <= budget_bytes {
            if sep_len > 0 {
                block.push_str(ENTRY_SEPARATOR);
            }
            block.push_str(&header);
            block.push('\n');
            block.push_str(&cand.excerpt);
            used.push(cand);
            continue;
        }

        if block.is_empty() && header.len() + 1 < budget_bytes {
            let room_tokens = (budget_bytes - header.len() - 1) / CHARS_PER_TOKEN;
            let (cut, _) = truncate_to_tokens(&cand.excerpt, room_tokens);
            if cut.is_empty() {
                continue;
            }
            block.push_str(&header);
            block.push('\n');
            block.push_str(cut);
            let mut trimmed = cand.clone();
            trimmed.excerpt = cut.to_string();
            used.push(trimmed);
        }
    }

    Augmented {
        context_block: block,
        used,
    }
}
