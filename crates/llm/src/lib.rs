//! Model adapters: a two-method capability surface (`generate_reply` plus an
//! observable `generation_meta`) behind one trait, with a deterministic echo
//! adapter for tests and an OpenAI-compatible HTTP adapter for real runs.
//! Retry policy lives here, not in the runtime.

use std::env;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use pmm_config::AdapterConfig;

const HTTP_TIMEOUT_S: u64 = 30;

/// Deterministic generation metadata recorded on assistant messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMeta {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
}

impl GenerationMeta {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            temperature: 0.0,
            top_p: 1.0,
            seed: None,
        }
    }
}

/// A model adapter as seen by the runtime loop.
pub trait Adapter: Send + Sync {
    fn generate_reply(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
    fn generation_meta(&self) -> GenerationMeta;

    /// Adapter-supplied deterministic latency for diagnostics; `None` means
    /// measure wall-clock.
    fn deterministic_latency_ms(&self) -> Option<u64> {
        None
    }
}

/// Offline adapter: echoes the user prompt. Useful as a default and in tests
/// that do not script their own replies.
#[derive(Debug, Default)]
pub struct DummyAdapter;

impl Adapter for DummyAdapter {
    fn generate_reply(&self, _system_prompt: &str, user_prompt: &str) -> Result<String> {
        Ok(format!("Echo: {user_prompt}"))
    }

    fn generation_meta(&self) -> GenerationMeta {
        GenerationMeta::new("dummy", "echo")
    }

    fn deterministic_latency_ms(&self) -> Option<u64> {
        Some(0)
    }
}

/// Scripted adapter: returns queued replies in order, repeating the last one
/// when the queue runs dry. Records every user prompt it saw.
#[derive(Debug, Default)]
pub struct ScriptedAdapter {
    replies: Mutex<Vec<String>>,
    cursor: Mutex<usize>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(str::to_string).collect()),
            cursor: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Adapter for ScriptedAdapter {
    fn generate_reply(&self, _system_prompt: &str, user_prompt: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(user_prompt.to_string());
        let replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if replies.is_empty() {
            bail!("scripted adapter has no replies");
        }
        let idx = (*cursor).min(replies.len() - 1);
        *cursor += 1;
        Ok(replies[idx].clone())
    }

    fn generation_meta(&self) -> GenerationMeta {
        GenerationMeta::new("dummy", "scripted")
    }

    fn deterministic_latency_ms(&self) -> Option<u64> {
        Some(0)
    }
}

/// OpenAI-compatible chat completions adapter.
///
/// Transient 5xx failures retry with exponential backoff up to
/// `retry_count` extra attempts; everything else surfaces immediately.
pub struct OpenAiAdapter {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    retry_count: u32,
    retry_base_ms: u64,
}

impl OpenAiAdapter {
    pub fn new(config: &AdapterConfig) -> Result<Self> {
        let model = if config.model.is_empty() {
            env::var("PMM_OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
        } else {
            config.model.clone()
        };
        let base_url = env::var("PMM_OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_S))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base_url,
            model,
            retry_count: config.retry_count,
            retry_base_ms: config.retry_base_ms,
        })
    }

    fn api_key() -> Result<String> {
        env::var("PMM_OPENAI_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .map_err(|_| anyhow!("missing OpenAI API key (PMM_OPENAI_API_KEY)"))
    }
}

impl Adapter for OpenAiAdapter {
    fn generate_reply(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let key = Self::api_key()?;
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "top_p": 1,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });

        let attempts = self.retry_count + 1;
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry_base_ms * 2u64.pow(attempt - 1);
                std::thread::sleep(Duration::from_millis(delay));
            }
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&key)
                .json(&body)
                .send();
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        warn!(attempt, %status, "transient server error from chat API");
                        last_err = Some(anyhow!("server error: {status}"));
                        continue;
                    }
                    if !status.is_success() {
                        bail!("chat API returned {status}");
                    }
                    let data: serde_json::Value = resp.json().context("decoding chat response")?;
                    let content = data["choices"][0]["message"]["content"]
                        .as_str()
                        .unwrap_or("")
                        .to_string();
                    debug!(model = %self.model, "chat completion ok");
                    return Ok(content);
                }
                Err(err) => {
                    // Connection-level failures are treated as transient.
                    warn!(attempt, error = %err, "chat API request failed");
                    last_err = Some(err.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat adapter failed after retries")))
    }

    fn generation_meta(&self) -> GenerationMeta {
        GenerationMeta::new("openai", &self.model)
    }
}
