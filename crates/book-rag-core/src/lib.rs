//! # Book RAG Core
//!
//! Shared, runtime-free logic for the grounded book Q&A pipeline: data
//! models, store abstractions with in-memory backends, ranking and context
//! packing, fixed-window rate limiting, and prompt templates.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Everything that talks to the outside world lives in the `book-rag`
//! application crate and plugs in through the traits defined here.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Chunks, candidates, sessions, messages, the tagged [`models::Answer`] |
//! | [`text`] | Token estimation, word-boundary truncation, content hashing |
//! | [`embedding`] | [`embedding::Embedder`] trait and vector helpers |
//! | [`store`] | Vector, chunk, and session store traits |
//! | [`rank`] | Relevance floor, composite ordering, greedy context packing |
//! | [`ratelimit`] | Fixed-window admission with injected clock and counters |
//! | [`prompt`] | System/user instruction templates and refusal texts |

pub mod embedding;
pub mod models;
pub mod prompt;
pub mod rank;
pub mod ratelimit;
pub mod store;
pub mod text;
