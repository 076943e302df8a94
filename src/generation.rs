//! Generation agent: constrained prompting over an ordered provider list.
//!
//! The first configured provider is the primary. Each provider gets one
//! attempt bounded by the generation timeout. On error or timeout the next
//! provider is tried, and when the list is exhausted the query fails with
//! [`QueryError::GenerationUnavailable`]. The fallback logic lives in
//! [`attempt_in_order`], which knows nothing about completions.
//!
//! An empty context never reaches a provider: the answer is the fixed
//! refusal. Citations come from the packed candidates, never from the
//! model's text.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Method;

use book_rag_core::models::{Answer, Mode, RefusalReason, RetrievedCandidate};
use book_rag_core::prompt::{is_model_refusal, refusal_text, system_prompt, user_prompt};

use crate::config::{GenerationConfig, ProviderConfig};
use crate::error::QueryError;
use crate::http::{api_key_from_env, json_request, send_json, RetryPolicy};

/// Inputs to one completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Provider output with usage, when the provider reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// A text-generation backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion>;
}

/// Call `call` on each item in order until one succeeds within `per_attempt`.
///
/// Returns the index of the item that succeeded with its output, or the
/// error from every attempt. Each attempt future is dropped on timeout,
/// which cancels its in-flight I/O.
pub async fn attempt_in_order<'a, P, T, F, Fut>(
    items: &'a [P],
    per_attempt: Duration,
    mut call: F,
) -> std::result::Result<(usize, T), Vec<anyhow::Error>>
where
    F: FnMut(&'a P) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut errors = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match tokio::time::timeout(per_attempt, call(item)).await {
            Ok(Ok(out)) => return Ok((i, out)),
            Ok(Err(e)) => errors.push(e),
            Err(_) => errors.push(anyhow!(
                "timed out after {} ms",
                per_attempt.as_millis()
            )),
        }
    }
    Err(errors)
}

/// Answer plus provider metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub answer: Answer,
    /// Serving model; `None` when no provider was called.
    pub model: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

pub struct Generator {
    providers: Vec<Arc<dyn CompletionProvider>>,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    excerpt_chars: usize,
}

impl Generator {
    pub fn new(
        providers: Vec<Arc<dyn CompletionProvider>>,
        config: &GenerationConfig,
        excerpt_chars: usize,
    ) -> Self {
        Self {
            providers,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
            excerpt_chars,
        }
    }

    /// Generate an answer from `context_block`.
    ///
    /// `cited` are the candidates packed into the context, in citation
    /// order. They become the answer's refs in full-corpus mode; selected
    /// text answers never carry refs.
    pub async fn generate(
        &self,
        query: &str,
        context_block: &str,
        mode: Mode,
        cited: &[RetrievedCandidate],
    ) -> Result<Generated, QueryError> {
        if context_block.trim().is_empty() {
            tracing::debug!(mode = mode.as_str(), "empty context, refusing without provider call");
            return Ok(Generated {
                answer: Answer::Refused {
                    reason: RefusalReason::NoContext,
                    text: refusal_text(mode).to_string(),
                },
                model: None,
                input_tokens: None,
                output_tokens: None,
            });
        }

        let req = CompletionRequest {
            system: system_prompt(mode),
            user: user_prompt(mode, context_block, query),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let (index, completion) =
            attempt_in_order(&self.providers, self.timeout, |p| p.complete(&req))
                .await
                .map_err(|errors| {
                    let detail = errors
                        .iter()
                        .zip(&self.providers)
                        .map(|(e, p)| format!("{}: {:#}", p.name(), e))
                        .collect::<Vec<_>>()
                        .join("; ");
                    tracing::error!(%detail, "all generation providers failed");
                    QueryError::GenerationUnavailable(detail)
                })?;

        if index > 0 {
            tracing::warn!(
                provider = self.providers[index].name(),
                "answer served by fallback provider"
            );
        }

        let text = completion.text.trim().to_string();
        let answer = if text.is_empty() || is_model_refusal(mode, &text) {
            Answer::Refused {
                reason: RefusalReason::ModelDeclined,
                text: refusal_text(mode).to_string(),
            }
        } else {
            let refs = match mode {
                Mode::FullCorpus => cited
                    .iter()
                    .map(|c| c.to_source_ref(self.excerpt_chars))
                    .collect(),
                Mode::SelectedText => Vec::new(),
            };
            Answer::Grounded { text, refs }
        };

        Ok(Generated {
            answer,
            model: Some(completion.model),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        })
    }
}

/// Build providers in configured order.
pub fn create_providers(config: &GenerationConfig) -> Result<Vec<Arc<dyn CompletionProvider>>> {
    config
        .providers
        .iter()
        .map(|p| -> Result<Arc<dyn CompletionProvider>> {
            match p.kind.as_str() {
                "openai" => Ok(Arc::new(OpenAiChat::new(p, config.timeout())?)),
                "ollama" => Ok(Arc::new(OllamaChat::new(p, config.timeout())?)),
                other => bail!("Unknown generation provider kind: {}", other),
            }
        })
        .collect()
}

// ============ OpenAI-compatible chat ============

pub struct OpenAiChat {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    label: String,
}

impl OpenAiChat {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let api_key = api_key_from_env(&config.api_key_env)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model: config.model.clone(),
            label: format!("openai:{}", config.model),
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiChat {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": req.system },
                { "role": "user", "content": req.user }
            ],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });
        let url = format!("{}/chat/completions", self.url.trim_end_matches('/'));
        let json = send_json("OpenAI chat", RetryPolicy::NONE, || {
            json_request(&self.client, Method::POST, &url, Some(self.api_key.as_str()), &body)
        })
        .await?;
        parse_openai_chat(&json, &self.model)
    }
}

fn parse_openai_chat(json: &serde_json::Value, requested_model: &str) -> Result<Completion> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))?;
    let token_count = |path: &str| {
        json.pointer(path)
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    };
    Ok(Completion {
        text: text.to_string(),
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(requested_model)
            .to_string(),
        input_tokens: token_count("/usage/prompt_tokens"),
        output_tokens: token_count("/usage/completion_tokens"),
    })
}

// ============ Ollama chat ============

pub struct OllamaChat {
    client: reqwest::Client,
    url: String,
    model: String,
    label: String,
}

impl OllamaChat {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: config.model.clone(),
            label: format!("ollama:{}", config.model),
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaChat {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": req.system },
                { "role": "user", "content": req.user }
            ],
            "stream": false,
            "options": {
                "temperature": req.temperature,
                "num_predict": req.max_tokens,
            },
        });
        let url = format!("{}/api/chat", self.url.trim_end_matches('/'));
        let json = send_json("Ollama chat", RetryPolicy::NONE, || {
            json_request(&self.client, Method::POST, &url, None, &body)
        })
        .await?;
        parse_ollama_chat(&json, &self.model)
    }
}

fn parse_ollama_chat(json: &serde_json::Value, requested_model: &str) -> Result<Completion> {
    let text = json
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing message.content"))?;
    Ok(Completion {
        text: text.to_string(),
        model: requested_model.to_string(),
        input_tokens: json
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        output_tokens: json
            .get("eval_count")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
    })
}
