//! Chat-completion clients for the configured model provider.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pledge_core::config::{LlmConfig, LlmProvider};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    /// Serialized conversation context, sent as the single user turn.
    pub context_json: String,
    pub top_p: Decimal,
    pub temperature: Decimal,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("llm transport failed: {0}")]
    Transport(String),
    #[error("llm provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
    #[error("llm returned an empty completion")]
    EmptyCompletion,
    #[error("llm client misconfigured: {0}")]
    Configuration(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::EmptyCompletion | Self::Configuration(_) => false,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self { max_retries: config.max_retries, ..Self::default() }
    }

    /// Longest a full `complete` call can take when every attempt runs into
    /// the per-request `timeout` and every retry waits its full backoff.
    pub fn total_budget(&self, timeout: Duration) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let backoff: Duration = (0..self.max_retries).map(|attempt| self.backoff(attempt)).sum();
        timeout.saturating_mul(attempts).saturating_add(backoff)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Talks to OpenAI-compatible `chat/completions` endpoints (OpenAI, Ollama)
/// and to Anthropic's `messages` endpoint.
pub struct HttpLlmClient {
    client: reqwest::Client,
    provider: LlmProvider,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    retry: RetryPolicy,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| LlmError::Configuration(error.to_string()))?;

        if matches!(config.provider, LlmProvider::OpenAi | LlmProvider::Anthropic)
            && config.api_key.is_none()
        {
            return Err(LlmError::Configuration(format!(
                "provider `{}` requires llm.api_key",
                provider_label(config.provider)
            )));
        }

        Ok(Self {
            client,
            provider: config.provider,
            endpoint: endpoint_for(config.provider, config.base_url.as_deref()),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let builder = match self.provider {
            LlmProvider::Anthropic => {
                let mut builder = self
                    .client
                    .post(&self.endpoint)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&AnthropicRequest::from_request(&self.model, request));
                if let Some(key) = &self.api_key {
                    builder = builder.header("x-api-key", key.expose_secret());
                }
                builder
            }
            LlmProvider::OpenAi | LlmProvider::Ollama => {
                let mut builder =
                    self.client.post(&self.endpoint).json(&ChatRequest::from_request(&self.model, request));
                if let Some(key) = &self.api_key {
                    builder = builder.bearer_auth(key.expose_secret());
                }
                builder
            }
        };

        let response = builder.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body: truncate(&body, 512) });
        }

        let text = match self.provider {
            LlmProvider::Anthropic => {
                let body: AnthropicResponse =
                    response.json().await.map_err(|error| LlmError::Decode(error.to_string()))?;
                body.content
                    .into_iter()
                    .filter(|block| block.kind == "text")
                    .filter_map(|block| block.text)
                    .collect::<Vec<_>>()
                    .join("")
            }
            LlmProvider::OpenAi | LlmProvider::Ollama => {
                let body: ChatResponse =
                    response.json().await.map_err(|error| LlmError::Decode(error.to_string()))?;
                body.choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .unwrap_or_default()
            }
        };

        if text.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.send_once(request).await {
                Ok(text) => {
                    debug!(
                        event_name = "agent.llm.completed",
                        provider = provider_label(self.provider),
                        attempt,
                        completion_len = text.len(),
                        "llm completion received"
                    );
                    return Ok(text);
                }
                Err(error) if error.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        event_name = "agent.llm.retry",
                        provider = provider_label(self.provider),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "llm call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn endpoint_for(provider: LlmProvider, base_url: Option<&str>) -> String {
    let base = base_url.map(|url| url.trim_end_matches('/').to_string());
    match provider {
        LlmProvider::OpenAi => {
            format!("{}/chat/completions", base.unwrap_or_else(|| "https://api.openai.com/v1".to_string()))
        }
        LlmProvider::Ollama => {
            format!("{}/v1/chat/completions", base.unwrap_or_else(|| "http://localhost:11434".to_string()))
        }
        LlmProvider::Anthropic => {
            format!("{}/v1/messages", base.unwrap_or_else(|| "https://api.anthropic.com".to_string()))
        }
    }
}

fn provider_label(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "openai",
        LlmProvider::Anthropic => "anthropic",
        LlmProvider::Ollama => "ollama",
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn sampling(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

impl<'a> ChatRequest<'a> {
    fn from_request(model: &'a str, request: &'a CompletionRequest) -> Self {
        Self {
            model,
            messages: vec![
                ChatMessage { role: "system", content: &request.system_prompt },
                ChatMessage { role: "user", content: &request.context_json },
            ],
            temperature: sampling(request.temperature),
            top_p: sampling(request.top_p),
            max_tokens: request.max_tokens,
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
}

impl<'a> AnthropicRequest<'a> {
    fn from_request(model: &'a str, request: &'a CompletionRequest) -> Self {
        Self {
            model,
            system: &request.system_prompt,
            messages: vec![ChatMessage { role: "user", content: &request.context_json }],
            max_tokens: request.max_tokens,
            temperature: sampling(request.temperature),
            top_p: sampling(request.top_p),
        }
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Replays canned completions in order and records every request it saw.
#[derive(Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlmClient {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        Self { responses: Mutex::new(responses.into_iter().collect()), requests: Mutex::default() }
    }

    pub fn replying(completion: impl Into<String>) -> Self {
        Self::new([Ok(completion.into())])
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.responses
            .lock()
            .map_err(|_| LlmError::Transport("script lock poisoned".to_string()))?
            .pop_front()
            .unwrap_or(Err(LlmError::Transport("no scripted completion left".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use pledge_core::config::{LlmConfig, LlmProvider};
    use std::time::Duration;

    use rust_decimal::Decimal;
    use secrecy::SecretString;

    use super::{CompletionRequest, HttpLlmClient, LlmClient, LlmError, RetryPolicy};

    fn request() -> CompletionRequest {
        CompletionRequest {
            system_prompt: "Track promises.".to_string(),
            context_json: r#"{"history":[]}"#.to_string(),
            top_p: Decimal::ONE,
            temperature: Decimal::new(7, 1),
            max_tokens: 300,
        }
    }

    fn config(provider: LlmProvider, base_url: String) -> LlmConfig {
        LlmConfig {
            provider,
            api_key: Some(SecretString::from("sk-test".to_string())),
            base_url: Some(base_url),
            model: "test-model".to_string(),
            timeout_secs: 5,
            max_retries: 1,
            max_tokens: 300,
        }
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy { max_retries: 1, base_delay_ms: 1, max_delay_ms: 1 }
    }

    #[tokio::test]
    async fn openai_request_carries_prompts_and_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "test-model",
                "messages": [
                    {"role": "system", "content": "Track promises."},
                    {"role": "user", "content": "{\"history\":[]}"}
                ],
                "max_tokens": 300
            })))
            .with_status(200)
            .with_body(r#"{"choices": [{"message": {"role": "assistant", "content": "{\"response\": \"hi\"}"}}]}"#)
            .create_async()
            .await;

        let client =
            HttpLlmClient::from_config(&config(LlmProvider::OpenAi, server.url())).expect("client");
        let text = client.complete(&request()).await.expect("completion");

        assert_eq!(text, r#"{"response": "hi"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn anthropic_text_blocks_are_joined() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-test")
            .match_header("anthropic-version", "2023-06-01")
            .with_status(200)
            .with_body(r#"{"content": [{"type": "text", "text": "part one "}, {"type": "text", "text": "part two"}]}"#)
            .create_async()
            .await;

        let client =
            HttpLlmClient::from_config(&config(LlmProvider::Anthropic, server.url())).expect("client");

        assert_eq!(client.complete(&request()).await.expect("completion"), "part one part two");
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .expect(2)
            .create_async()
            .await;

        let client = HttpLlmClient::from_config(&config(LlmProvider::OpenAi, server.url()))
            .expect("client")
            .with_retry_policy(fast_retries());
        let error = client.complete(&request()).await.expect_err("still failing");

        assert_eq!(error, LlmError::Status { status: 503, body: "overloaded".to_string() });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let client = HttpLlmClient::from_config(&config(LlmProvider::OpenAi, server.url()))
            .expect("client")
            .with_retry_policy(fast_retries());

        assert!(matches!(
            client.complete(&request()).await,
            Err(LlmError::Status { status: 400, .. })
        ));
        mock.assert_async().await;
    }

    #[test]
    fn total_budget_covers_every_attempt_and_backoff() {
        let retry = RetryPolicy { max_retries: 2, ..RetryPolicy::default() };
        assert_eq!(
            retry.total_budget(Duration::from_secs(5)),
            Duration::from_secs(15) + Duration::from_millis(250 + 500)
        );

        let no_retries = RetryPolicy { max_retries: 0, ..RetryPolicy::default() };
        assert_eq!(no_retries.total_budget(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn hosted_providers_need_an_api_key() {
        let mut config = config(LlmProvider::OpenAi, "http://localhost".to_string());
        config.api_key = None;

        assert!(matches!(HttpLlmClient::from_config(&config), Err(LlmError::Configuration(_))));

        config.provider = LlmProvider::Ollama;
        let client = HttpLlmClient::from_config(&config).expect("ollama runs keyless");
        assert_eq!(client.endpoint(), "http://localhost/v1/chat/completions");
    }
}
