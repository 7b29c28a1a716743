//! Chat completion provider seam.
//!
//! The backend only ever needs "system + user (+ images) in, text out", so
//! the trait stays deliberately small. `HttpChatClient` speaks the
//! OpenAI-compatible chat completions shape; `MockChatProvider` replays
//! scripted responses for tests and for the server's mock mode.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use tracing::debug;

use crate::types::SelectedRegion;

/// A JPEG crop attached to a request, paired with the region it came from.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub region: SelectedRegion,
    pub jpeg_bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub images: Vec<ImageAttachment>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object response where supported.
    pub json_mode: bool,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

// ── HTTP client ──────────────────────────────────────────────────────────

/// OpenAI-compatible chat completions client.
pub struct HttpChatClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct CompletionBody {
    model: String,
    messages: Vec<serde_json::Value>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

impl HttpChatClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    fn user_message(request: &ChatRequest) -> serde_json::Value {
        if request.images.is_empty() {
            return json!({ "role": "user", "content": request.user });
        }
        // Multi-part content: the text prompt followed by each crop as a
        // data URL, in region order.
        let mut parts = vec![json!({ "type": "text", "text": request.user })];
        for image in &request.images {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&image.jpeg_bytes);
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{}", encoded) },
            }));
        }
        json!({ "role": "user", "content": parts })
    }
}

#[async_trait]
impl ChatProvider for HttpChatClient {
    fn name(&self) -> &'static str {
        "http_chat"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = CompletionBody {
            model: self.model.clone(),
            messages: vec![
                json!({ "role": "system", "content": request.system }),
                Self::user_message(request),
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_mode
                .then(|| json!({ "type": "json_object" })),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut call = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.context("failed to call chat provider")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("chat provider error ({}): {}", status, text);
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .context("failed to parse chat provider response")?;
        let usage = completion.usage.unwrap_or_default();
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        debug!(
            "chat completion: {} prompt tokens, {} completion tokens",
            usage.prompt_tokens, usage.completion_tokens
        );

        Ok(ChatResponse {
            content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

// ── Mock provider ────────────────────────────────────────────────────────

/// Scripted provider for tests and mock mode. Responses pop in order; when
/// the script runs dry it falls back to a canned sticker payload so window
/// sessions in mock mode still make progress.
pub struct MockChatProvider {
    script: Mutex<VecDeque<Result<String, String>>>,
    fallback: String,
}

impl MockChatProvider {
    pub fn new<S: AsRef<str>>(responses: Vec<S>) -> Self {
        Self {
            script: Mutex::new(
                responses
                    .into_iter()
                    .map(|r| Ok(r.as_ref().to_string()))
                    .collect(),
            ),
            fallback: Self::default_sticker_payload(),
        }
    }

    /// Mixed script: `Err` entries simulate provider failures.
    pub fn scripted(responses: Vec<Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            fallback: Self::default_sticker_payload(),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    fn default_sticker_payload() -> String {
        json!([
            {
                "anchorText": "key idea",
                "explanation": "A short explanation of the key idea on this page."
            }
        ])
        .to_string()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    fn name(&self) -> &'static str {
        "mock_chat"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        let next = self.script.lock().pop_front();
        let content = match next {
            Some(Ok(content)) => content,
            Some(Err(message)) => anyhow::bail!("mock provider error: {}", message),
            None => self.fallback.clone(),
        };
        Ok(ChatResponse {
            content,
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    }
}
