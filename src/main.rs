//! # Book RAG CLI (`bookrag`)
//!
//! ## Usage
//!
//! ```bash
//! bookrag --config ./config/bookrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bookrag init` | Create the SQLite database and run schema migrations |
//! | `bookrag ingest <file.jsonl>` | Index pre-chunked book content into the active corpus |
//! | `bookrag ask "<question>"` | Answer a question from the whole book |
//! | `bookrag ask-selection "<question>" --selection "<text>"` | Answer from a passage only |
//! | `bookrag history <session-id>` | Print a session's messages |
//! | `bookrag serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! bookrag init
//! bookrag ingest ./build/chunks.jsonl
//! bookrag ask "What is ROS 2?" --module "Module 1"
//! bookrag serve
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use book_rag::config::{self, Config};
use book_rag::ingest;
use book_rag::migrate;
use book_rag::orchestrator::{Components, Orchestrator, QueryRequest, SelectionRequest};
use book_rag::server;
use book_rag::telemetry;
use book_rag_core::models::MetadataFilter;
use book_rag_core::ratelimit::InMemoryCounterStore;

/// Client key used for rate limiting CLI queries.
const CLI_CLIENT: &str = "cli";

/// Book RAG: grounded question answering over a technical book.
#[derive(Parser)]
#[command(
    name = "bookrag",
    about = "Grounded question answering over a technical book",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bookrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Index a JSONL file of chunk records into the active corpus version.
    ///
    /// Each line is `{"module", "chapter", "section", "chunk_index", "content"}`.
    /// Records whose content is already indexed are skipped.
    Ingest {
        file: PathBuf,

        /// Count records without embedding or writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask a question against the whole corpus.
    Ask {
        query: String,

        /// Continue an existing session.
        #[arg(long)]
        session: Option<String>,

        /// Only retrieve from this module.
        #[arg(long)]
        module: Option<String>,

        /// Only retrieve from this chapter.
        #[arg(long)]
        chapter: Option<String>,

        /// Number of candidates to retrieve (clamped to `retrieval.max_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Ask a question about a selected passage only.
    AskSelection {
        query: String,

        /// The selected text.
        #[arg(long, conflicts_with = "selection_file")]
        selection: Option<String>,

        /// Read the selected text from a file.
        #[arg(long)]
        selection_file: Option<PathBuf>,

        #[arg(long)]
        session: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print a session's message history.
    History {
        session_id: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Only messages after this sequence number.
        #[arg(long)]
        after: Option<i64>,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

async fn orchestrator(cfg: &Config) -> Result<Orchestrator> {
    let components = Components::from_config(cfg, Arc::new(InMemoryCounterStore::new())).await?;
    Ok(Orchestrator::new(cfg, components))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    telemetry::init_tracing(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, dry_run } => {
            ingest::run_ingest(&cfg, &file, dry_run).await?;
        }
        Commands::Ask {
            query,
            session,
            module,
            chapter,
            top_k,
            json,
        } => {
            let filter = MetadataFilter { module, chapter };
            let req = QueryRequest {
                query,
                session_id: session,
                user_id: None,
                filter: (!filter.is_empty()).then_some(filter),
                top_k,
            };
            let resp = orchestrator(&cfg).await?.query(req, CLI_CLIENT).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&resp)?);
            } else {
                println!("{}", resp.answer);
                if !resp.source_refs.is_empty() {
                    println!();
                    for (i, r) in resp.source_refs.iter().enumerate() {
                        println!("[Source {}] {}", i + 1, r.chunk_id);
                        println!("    {}", r.excerpt.replace('\n', " "));
                    }
                }
                println!();
                println!("session: {}  ({} ms)", resp.session_id, resp.latency_ms);
            }
        }
        Commands::AskSelection {
            query,
            selection,
            selection_file,
            session,
            json,
        } => {
            let selected_text = match (selection, selection_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read selection file: {}", path.display()))?,
                (None, None) => bail!("Provide --selection or --selection-file"),
            };
            let req = SelectionRequest {
                query,
                selected_text,
                session_id: session,
                user_id: None,
            };
            let resp = orchestrator(&cfg)
                .await?
                .query_selected_text(req, CLI_CLIENT)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&resp)?);
            } else {
                println!("{}", resp.answer);
                println!();
                if resp.selection_truncated {
                    println!("(selection was truncated)");
                }
                println!("session: {}  ({} ms)", resp.session_id, resp.latency_ms);
            }
        }
        Commands::History {
            session_id,
            limit,
            after,
        } => {
            let page = orchestrator(&cfg)
                .await?
                .get_history(&session_id, limit, after)
                .await?;
            println!("session {} ({} messages)", page.session_id, page.message_count);
            for m in &page.messages {
                println!();
                println!("#{} [{}] {}", m.seq, m.mode.as_str(), m.created_at.to_rfc3339());
                println!("Q: {}", m.user_text);
                println!("A: {}", m.assistant_text);
            }
            if let Some(cursor) = page.next_cursor {
                println!();
                println!("more: --after {}", cursor);
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
