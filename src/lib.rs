//! # Book RAG
//!
//! Grounded question answering over a technical book.
//!
//! A question is embedded, matched against the book's chunks in a vector
//! store, packed into a bounded context block, and answered by a chat model
//! that is instructed to use nothing else. Questions about a passage the
//! reader selected skip retrieval, and the answer is checked against the
//! selection before it is returned. Every turn is stored in a session, and
//! admission is rate limited per session and per client address.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌─────────────┐   ┌───────────┐   ┌────────────┐   ┌─────────┐
//! │  HTTP  │──▶│ Rate limiter │──▶│ Retriever │──▶│ Augment    │──▶│Generator│
//! │  / CLI │   └─────────────┘   │ embed+search│  │ rank+pack  │   │ primary │
//! └────────┘                     └───────────┘   └────────────┘   │ fallback│
//!      ▲                                                          └────┬────┘
//!      │            ┌──────────┐      ┌───────────┐                    │
//!      └────────────│ Sessions │◀─────│ Validator │◀───────────────────┘
//!                   │ (SQLite) │      │(selection)│
//!                   └──────────┘      └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | Chunk, vector, and session stores on SQLite |
//! | [`qdrant`] | Qdrant vector store |
//! | [`http`] | JSON-over-HTTP helper with retry |
//! | [`embedding`] | OpenAI and Ollama embedders |
//! | [`retrieval`] | Embed, search, floor, hydrate, retry once |
//! | [`generation`] | Prompting over an ordered provider list |
//! | [`validator`] | Selected-text preparation and answer validation |
//! | [`session`] | Session ids and history paging |
//! | [`orchestrator`] | Per-request pipeline and wiring |
//! | [`ingest`] | Indexing pre-chunked content |
//! | [`server`] | HTTP API |
//! | [`telemetry`] | Tracing subscriber |
//! | [`error`] | Typed pipeline errors |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod migrate;
pub mod orchestrator;
pub mod qdrant;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod sqlite_store;
pub mod telemetry;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;
