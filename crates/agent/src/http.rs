//! HTTP completion backends: OpenAI-compatible chat completions, Anthropic
//! messages and Ollama chat.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use ganglion_core::config::{LlmConfig, LlmProvider};
use ganglion_core::domain::conversation::{Role, Turn};

use crate::llm::{Completion, LlmClient, LlmError};

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com/v1";
const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct HttpCompletionClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl HttpCompletionClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::InvalidResponse(format!("http client setup: {error}")))?;

        let default_base = match config.provider {
            LlmProvider::OpenAi => OPENAI_DEFAULT_BASE,
            LlmProvider::Anthropic => ANTHROPIC_DEFAULT_BASE,
            LlmProvider::Ollama => OLLAMA_DEFAULT_BASE,
        };
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(default_base)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            provider: config.provider,
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    fn completion_url(&self) -> String {
        match self.provider {
            LlmProvider::OpenAi => format!("{}/chat/completions", self.base_url),
            LlmProvider::Anthropic => format!("{}/messages", self.base_url),
            LlmProvider::Ollama => format!("{}/api/chat", self.base_url),
        }
    }

    fn probe_url(&self) -> String {
        match self.provider {
            LlmProvider::OpenAi | LlmProvider::Anthropic => format!("{}/models", self.base_url),
            LlmProvider::Ollama => format!("{}/api/tags", self.base_url),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let Some(api_key) = self.api_key.as_ref() else {
            return request;
        };
        match self.provider {
            LlmProvider::OpenAi => request.bearer_auth(api_key.expose_secret()),
            LlmProvider::Anthropic => request
                .header("x-api-key", api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
            LlmProvider::Ollama => request,
        }
    }

    fn request_body(&self, turns: &[Turn]) -> Value {
        build_request_body(self.provider, &self.model, self.max_tokens, self.temperature, turns)
    }
}

#[async_trait]
impl LlmClient for HttpCompletionClient {
    async fn complete(&self, turns: &[Turn]) -> Result<Completion, LlmError> {
        let request = self.client.post(self.completion_url()).json(&self.request_body(turns));
        let response = self.authorize(request).send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| LlmError::InvalidResponse(format!("response body: {error}")))?;
        let content = extract_content(self.provider, &body)?;

        debug!(
            event_name = "llm.completion.received",
            provider = ?self.provider,
            model = %self.model,
            turns = turns.len(),
            chars = content.len(),
            "completion received"
        );
        Ok(Completion::new(content))
    }

    async fn probe(&self) -> Result<(), LlmError> {
        let request = self.client.get(self.probe_url());
        let response = self.authorize(request).send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(classify_status(status, ""))
        }
    }
}

/// Only failures to reach the backend suspend a session. Anything else the
/// client reports about its own request is final.
pub(crate) fn transport_error(error: reqwest::Error) -> LlmError {
    if error.is_connect() || error.is_timeout() {
        LlmError::Unavailable(error.to_string())
    } else {
        LlmError::InvalidResponse(error.to_string())
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> LlmError {
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("no reason").to_string()
    } else {
        body.chars().take(512).collect()
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        LlmError::Unavailable(format!("status {}: {message}", status.as_u16()))
    } else {
        LlmError::Rejected { status: status.as_u16(), message }
    }
}

pub(crate) fn build_request_body(
    provider: LlmProvider,
    model: &str,
    max_tokens: u32,
    temperature: f32,
    turns: &[Turn],
) -> Value {
    match provider {
        LlmProvider::OpenAi => json!({
            "model": model,
            "messages": chat_messages(turns),
            "max_tokens": max_tokens,
            "temperature": temperature,
        }),
        LlmProvider::Ollama => json!({
            "model": model,
            "messages": chat_messages(turns),
            "stream": false,
            "options": { "temperature": temperature, "num_predict": max_tokens },
        }),
        LlmProvider::Anthropic => {
            let system = turns
                .iter()
                .filter(|turn| turn.role == Role::System)
                .map(|turn| turn.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let messages = anthropic_messages(turns);
            let mut body = json!({
                "model": model,
                "messages": messages,
                "max_tokens": max_tokens,
                "temperature": temperature,
            });
            if !system.is_empty() {
                body["system"] = Value::String(system);
            }
            body
        }
    }
}

fn chat_messages(turns: &[Turn]) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| json!({ "role": turn.role.as_str(), "content": turn.content }))
        .collect()
}

/// Anthropic takes system text out of band and expects alternating roles,
/// so consecutive turns of the same role are merged.
fn anthropic_messages(turns: &[Turn]) -> Vec<Value> {
    let mut merged: Vec<(Role, String)> = Vec::new();
    for turn in turns.iter().filter(|turn| turn.role != Role::System) {
        match merged.last_mut() {
            Some((role, content)) if *role == turn.role => {
                content.push_str("\n\n");
                content.push_str(&turn.content);
            }
            _ => merged.push((turn.role, turn.content.clone())),
        }
    }
    if merged.first().map(|(role, _)| *role == Role::Assistant).unwrap_or(false) {
        merged.insert(0, (Role::User, "(continue)".to_string()));
    }
    merged
        .into_iter()
        .map(|(role, content)| json!({ "role": role.as_str(), "content": content }))
        .collect()
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: ChatMessage,
}

pub(crate) fn extract_content(provider: LlmProvider, body: &Value) -> Result<String, LlmError> {
    let invalid = |error: serde_json::Error| LlmError::InvalidResponse(error.to_string());
    let content = match provider {
        LlmProvider::OpenAi => {
            let parsed = OpenAiResponse::deserialize(body).map_err(invalid)?;
            parsed.choices.into_iter().next().and_then(|choice| choice.message.content)
        }
        LlmProvider::Anthropic => {
            let parsed = AnthropicResponse::deserialize(body).map_err(invalid)?;
            let text = parsed
                .content
                .into_iter()
                .filter(|block| block.kind == "text")
                .filter_map(|block| block.text)
                .collect::<Vec<_>>()
                .join("");
            Some(text).filter(|text| !text.is_empty())
        }
        LlmProvider::Ollama => OllamaResponse::deserialize(body).map_err(invalid)?.message.content,
    };

    content.ok_or_else(|| LlmError::InvalidResponse("completion carried no text".to_string()))
}
