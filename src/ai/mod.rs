//! Narrative model client: one `ask` operation over a primary provider
//! with a fallback, both speaking the same chat-completion wire shape.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::{AiConfig, AiProviderConfig};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Narrative provider failure modes.
#[derive(Error, Debug, Clone)]
pub enum AiError {
    #[error("provider not configured")]
    NotConfigured,

    #[error("authentication rejected")]
    Auth,

    #[error("request malformed: {0}")]
    BadRequest(String),

    #[error("rate limited")]
    RateLimited,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("transport: {0}")]
    Transport(String),

    #[error("call exceeded {0:?} wall clock")]
    Timeout(Duration),
}

impl AiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AiError::RateLimited | AiError::Transport(_) | AiError::Timeout(_) => true,
            AiError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

/// A single narrative completion operation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NarrativeProvider: Send + Sync {
    async fn ask(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, AiError>;

    /// Display name for logs and warnings.
    fn name(&self) -> &str;
}

// Chat-completion request/response shapes shared by both providers.

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// HTTP-backed provider; primary and fallback differ only in endpoint, key
/// and model identifier.
pub struct HttpNarrativeProvider {
    http: reqwest::Client,
    name: String,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpNarrativeProvider {
    pub fn new(name: &str, config: &AiProviderConfig) -> Result<Self, AiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AiError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            name: name.to_string(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl NarrativeProvider for HttpNarrativeProvider {
    async fn ask(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, AiError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
            temperature,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Timeout(Duration::from_secs(60))
                } else {
                    AiError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AiError::Auth);
        }
        if status.as_u16() == 429 {
            return Err(AiError::RateLimited);
        }
        if status.as_u16() == 400 {
            let detail = response.text().await.unwrap_or_default();
            return Err(AiError::BadRequest(detail));
        }
        if !status.is_success() {
            return Err(AiError::Status(status.as_u16()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Failover wrapper: retries the primary up to three attempts with doubling
/// backoff, then tries the fallback the same way; each call is capped at a
/// total wall clock.
pub struct AiClient {
    providers: Vec<Arc<dyn NarrativeProvider>>,
    gate: Arc<Semaphore>,
    call_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl AiClient {
    /// Build from configuration; `None` when no primary provider is
    /// configured (narratives degrade).
    pub fn from_config(config: &AiConfig) -> Option<Self> {
        let mut providers: Vec<Arc<dyn NarrativeProvider>> = Vec::new();
        if let Some(primary) = &config.primary {
            match HttpNarrativeProvider::new("primary", primary) {
                Ok(p) => providers.push(Arc::new(p)),
                Err(e) => tracing::warn!("primary narrative provider unavailable: {e}"),
            }
        }
        if let Some(fallback) = &config.fallback {
            match HttpNarrativeProvider::new("fallback", fallback) {
                Ok(p) => providers.push(Arc::new(p)),
                Err(e) => tracing::warn!("fallback narrative provider unavailable: {e}"),
            }
        }
        if providers.is_empty() {
            return None;
        }
        Some(Self {
            providers,
            gate: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            call_timeout: Duration::from_secs(config.timeout_secs),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    #[cfg(test)]
    pub fn with_providers(providers: Vec<Arc<dyn NarrativeProvider>>) -> Self {
        Self {
            providers,
            gate: Arc::new(Semaphore::new(4)),
            call_timeout: Duration::from_secs(90),
            max_tokens: 1024,
            temperature: 0.2,
        }
    }

    /// Ask for a narrative. Errors bubble up to the assembler, which
    /// demotes them to warnings; this call never takes longer than the
    /// configured wall clock.
    pub async fn ask_narrative(&self, prompt: &str) -> Result<String, AiError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| AiError::Transport("narrative gate closed".into()))?;

        tokio::time::timeout(self.call_timeout, self.ask_with_failover(prompt))
            .await
            .map_err(|_| AiError::Timeout(self.call_timeout))?
    }

    async fn ask_with_failover(&self, prompt: &str) -> Result<String, AiError> {
        let mut last_err = AiError::NotConfigured;
        for provider in &self.providers {
            match self.ask_with_retries(provider.as_ref(), prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "narrative provider failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn ask_with_retries(
        &self,
        provider: &dyn NarrativeProvider,
        prompt: &str,
    ) -> Result<String, AiError> {
        let mut backoff = BACKOFF_BASE;
        let mut last_err = AiError::NotConfigured;
        for attempt in 1..=MAX_ATTEMPTS {
            match provider.ask(prompt, self.max_tokens, self.temperature).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(provider = provider.name(), attempt, error = %e, "retrying narrative call");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}
