//! Deterministic doubles for the external providers, shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use book_rag_core::embedding::Embedder;

use crate::generation::{Completion, CompletionProvider, CompletionRequest};

/// Embeds text as keyword presence over a fixed vocabulary.
///
/// Dimension `i` is 1.0 when the lowercased text contains `vocab[i]`. A
/// trailing constant dimension keeps every vector non-zero. Texts sharing
/// keywords score close to 1.0; texts sharing none score close to 0.0.
pub struct KeywordEmbedder {
    vocab: Vec<String>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(vocab: &[&str]) -> Self {
        Self {
            vocab: vocab.iter().map(|v| v.to_lowercase()).collect(),
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` calls.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
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
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            bail!("embedding provider unreachable");
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// What a [`ScriptedProvider`] does on each call.
#[derive(Clone)]
pub enum Script {
    Reply(String),
    Fail(String),
    Hang,
}

/// A completion provider that follows a script and counts calls.
///
/// When the script runs out the last step repeats.
pub struct ScriptedProvider {
    name: String,
    steps: Mutex<Vec<Script>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, steps: Vec<Script>) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn replying(name: &str, text: &str) -> Self {
        Self::new(name, vec![Script::Reply(text.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req.clone());
        let step = {
            let mut steps = self.steps.lock().unwrap();
            if steps.len() > 1 {
                steps.remove(0)
            } else {
                steps[0].clone()
            }
        };
        match step {
            Script::Reply(text) => Ok(Completion {
                text,
                model: self.name.clone(),
                input_tokens: Some(100),
                output_tokens: Some(20),
            }),
            Script::Fail(msg) => bail!("{}", msg),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                bail!("unreachable")
            }
        }
    }
}
