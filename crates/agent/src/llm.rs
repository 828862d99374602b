//! Chat-completion clients behind one trait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use callquote_core::config::{LlmConfig, LlmProvider};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, messages: &[ChatMessage]) -> Result<String>;

    fn model_name(&self) -> &str;

    fn provider_name(&self) -> &str;
}

/// Drops leading assistant turns and merges consecutive same-role turns so
/// the list starts with a user turn and alternates.
pub fn alternate_turns(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut turns: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for message in messages.iter().skip_while(|message| message.role == ChatRole::Assistant) {
        match turns.last_mut() {
            Some(last) if last.role == message.role => {
                last.content.push('\n');
                last.content.push_str(&message.content);
            }
            _ => turns.push(message.clone()),
        }
    }
    turns
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to build http client")
}

#[derive(Clone)]
pub struct AnthropicClient {
    api_key: SecretString,
    base_url: String,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: SecretString, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            api_key,
            base_url: ANTHROPIC_BASE_URL.to_string(),
            model: model.into(),
            max_tokens,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, system: &str, messages: &[ChatMessage]) -> Result<String> {
        let turns: Vec<serde_json::Value> = alternate_turns(messages)
            .iter()
            .map(|turn| serde_json::json!({"role": turn.role.as_str(), "content": turn.content}))
            .collect();

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&serde_json::json!({
                "model": &self.model,
                "max_tokens": self.max_tokens,
                "system": system,
                "messages": turns,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Anthropic API error {}: {}", status, body));
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
        }

        let api_response: ApiResponse = response.json().await?;
        api_response
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| anyhow!("Empty response from Anthropic"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }
}

/// Client for `/v1/chat/completions`; serves both OpenAI and Ollama.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    provider: &'static str,
    api_key: Option<SecretString>,
    base_url: String,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(
        provider: &'static str,
        api_key: Option<SecretString>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            provider,
            api_key,
            base_url: base_url.into(),
            model: model.into(),
            max_tokens,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, system: &str, messages: &[ChatMessage]) -> Result<String> {
        let mut turns = vec![serde_json::json!({"role": "system", "content": system})];
        turns.extend(
            messages.iter().map(|turn| {
                serde_json::json!({"role": turn.role.as_str(), "content": turn.content})
            }),
        );

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/')))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "model": &self.model,
                "max_tokens": self.max_tokens,
                "temperature": 0.3,
                "response_format": {"type": "json_object"},
                "messages": turns,
            }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} API error {}: {}", self.provider, status, body));
        }

        #[derive(Deserialize)]
        struct Message {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<Choice>,
        }

        let api_response: ApiResponse = response.json().await?;
        api_response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("{} returned no choices", self.provider))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        self.provider
    }
}

/// Builds the configured client. The request timeout sits a second above the
/// extractor timeout so the extractor's own deadline fires first.
pub fn client_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    let http = http_client(config.timeout_secs + 1)?;

    let client: Arc<dyn LlmClient> = match config.provider {
        LlmProvider::Anthropic => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| anyhow!("llm.api_key is required for anthropic"))?;
            let mut client = AnthropicClient::new(api_key, &config.model, config.max_tokens)
                .with_http_client(http);
            if let Some(base_url) = &config.base_url {
                client = client.with_base_url(base_url);
            }
            Arc::new(client)
        }
        LlmProvider::OpenAi => Arc::new(
            OpenAiCompatibleClient::new(
                "openai",
                config.api_key.clone(),
                config.base_url.clone().unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
                &config.model,
                config.max_tokens,
            )
            .with_http_client(http),
        ),
        LlmProvider::Ollama => {
            let base_url = config
                .base_url
                .clone()
                .ok_or_else(|| anyhow!("llm.base_url is required for ollama"))?;
            Arc::new(
                OpenAiCompatibleClient::new(
                    "ollama",
                    config.api_key.clone(),
                    base_url,
                    &config.model,
                    config.max_tokens,
                )
                .with_http_client(http),
            )
        }
    };

    Ok(client)
}
