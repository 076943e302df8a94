//! Shared fixtures for integration tests: deterministic providers and a
//! SQLite-backed orchestrator in a temp directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use book_rag::config::{parse_config, Config};
use book_rag::db;
use book_rag::generation::{Completion, CompletionProvider, CompletionRequest};
use book_rag::ingest::{ChunkRecord, IndexOutcome, Indexer};
use book_rag::migrate;
use book_rag::orchestrator::{Components, Orchestrator};
use book_rag::sqlite_store::SqliteStore;
use book_rag_core::embedding::Embedder;
use book_rag_core::ratelimit::{InMemoryCounterStore, ManualClock};
use chrono::{TimeZone, Utc};

/// Keyword-presence embedder over a fixed vocabulary, plus a constant
/// dimension so no vector is zero.
pub struct KeywordEmbedder {
    vocab: Vec<String>,
    calls: AtomicUsize,
    broken: bool,
}

impl KeywordEmbedder {
    pub fn new(vocab: &[&str]) -> Self {
        Self {
            vocab: vocab.iter().map(|v| v.to_lowercase()).collect(),
            calls: AtomicUsize::new(0),
            broken: false,
        }
    }

    /// An embedder whose every call fails.
    pub fn broken(vocab: &[&str]) -> Self {
        Self {
            broken: true,
            ..Self::new(vocab)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = self
            .vocab
            .iter()
            .map(|w| if lower.contains(w.as_str()) { 1.0 } else { 0.0 })
            .collect();
        v.push(0.05);
        v
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }
    fn dims(&self) -> usize {
        self.vocab.len() + 1
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            bail!("connection refused");
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Replies with a fixed text, or fails every call.
pub struct FixedProvider {
    name: String,
    reply: Option<String>,
    calls: AtomicUsize,
}

impl FixedProvider {
    pub fn replying(name: &str, reply: &str) -> Self {
        Self {
            name: name.to_string(),
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reply: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for FixedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _req: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .reply
            .clone()
            .ok_or_else(|| anyhow!("503 Service Unavailable"))?;
        Ok(Completion {
            text,
            model: self.name.clone(),
            input_tokens: Some(250),
            output_tokens: Some(40),
        })
    }
}

/// Answers by looking up the question found in the user prompt.
pub struct ScriptedAnswers {
    answers: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl ScriptedAnswers {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            answers: Mutex::new(
                pairs
                    .iter()
                    .map(|(q, a)| (q.to_string(), a.to_string()))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn question_in(prompt: &str) -> Option<&str> {
    let start = prompt.rfind("Question: ")? + "Question: ".len();
    let rest = &prompt[start..];
    let end = rest.find("\n\nAnswer:").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

#[async_trait]
impl CompletionProvider for ScriptedAnswers {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let question = question_in(&req.user).ok_or_else(|| anyhow!("no question in prompt"))?;
        let text = self
            .answers
            .lock()
            .unwrap()
            .get(question)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted answer for {:?}", question))?;
        Ok(Completion {
            text,
            model: "scripted".to_string(),
            input_tokens: None,
            output_tokens: None,
        })
    }
}

pub const VOCAB: &[&str] = &["ros 2", "gazebo", "isaac", "humanoid", "urdf"];

/// Config in `tmp` with `extra` TOML appended.
pub fn test_config(tmp: &TempDir, extra: &str) -> Config {
    let toml = format!(
        r#"
[db]
path = "{}"

[corpus]
version = "v1"

[server]
bind = "127.0.0.1:0"

[retrieval]
retry_backoff_ms = 10
{}
"#,
        tmp.path().join("data/bookrag.sqlite").display(),
        extra
    );
    parse_config(&toml).unwrap()
}

pub fn record(module: &str, chapter: &str, section: &str, index: i64, content: &str) -> ChunkRecord {
    ChunkRecord {
        module: module.to_string(),
        chapter: chapter.to_string(),
        section: section.to_string(),
        chunk_index: index,
        content: content.to_string(),
    }
}

/// The small book every pipeline test runs against.
pub fn book() -> Vec<ChunkRecord> {
    vec![
        record("Module 1", "Foundations", "What is ROS 2", 0,
            "ROS 2 is the robotics middleware that connects every component in this book."),
        record("Module 2", "Simulation", "Gazebo basics", 1,
            "Gazebo simulates rigid-body physics and sensors."),
        record("Module 2", "Simulation", "Gazebo worlds", 2,
            "Worlds in Gazebo are described in SDF files."),
        record("Module 3", "Perception", "Isaac Sim", 3,
            "Isaac Sim renders photorealistic scenes for synthetic data."),
        record("Module 4", "Humanoids", "Describing robots", 4,
            "A humanoid is described with a URDF model."),
    ]
}

pub struct Fixture {
    pub config: Config,
    pub store: SqliteStore,
    pub orchestrator: Arc<Orchestrator>,
    /// chunk_index → chunk_id for the indexed book.
    pub chunk_ids: HashMap<i64, String>,
}

/// Migrate a fresh database, index [`book`], and wire an orchestrator.
pub async fn fixture(
    config: Config,
    embedder: Arc<dyn Embedder>,
    providers: Vec<Arc<dyn CompletionProvider>>,
) -> Fixture {
    migrate::run_migrations(&config).await.unwrap();
    let store = SqliteStore::new(db::connect(&config).await.unwrap());

    let indexing_embedder = Arc::new(KeywordEmbedder::new(VOCAB));
    let indexer = Indexer::new(
        indexing_embedder,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        &config.corpus.version,
    );
    let mut chunk_ids = HashMap::new();
    for r in book() {
        match indexer.index_chunk(&r).await.unwrap() {
            IndexOutcome::Indexed { chunk_id } => {
                chunk_ids.insert(r.chunk_index, chunk_id);
            }
            IndexOutcome::Unchanged { .. } => panic!("book content is unique"),
        }
    }

    let orchestrator = Orchestrator::new(
        &config,
        Components {
            embedder,
            vectors: Arc::new(store.clone()),
            chunks: Arc::new(store.clone()),
            sessions: Arc::new(store.clone()),
            providers,
            clock: Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 15).unwrap(),
            )),
            counters: Arc::new(InMemoryCounterStore::new()),
        },
    );

    Fixture {
        config,
        store,
        orchestrator: Arc::new(orchestrator),
        chunk_ids,
    }
}
