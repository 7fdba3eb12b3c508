//! Outbound HTTP collaborators
//!
//! Given plaintext input, an [`ExternalService`] returns plaintext output or
//! fails with [`Error::External`]. The bridge calls one after decoding a
//! reply; the relay calls one to compute its answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ExternalKind, ExternalSettings};
use crate::utils::error::{Error, Result};

#[async_trait]
pub trait ExternalService: Send + Sync {
    /// `reply` is the decoded message body, `request` the original request text.
    async fn call(&self, reply: &str, request: &str) -> Result<String>;
}

/// Builds the collaborator described by `settings`.
pub fn from_settings(settings: &ExternalSettings) -> Result<Arc<dyn ExternalService>> {
    let client = Client::builder()
        .timeout(Duration::from_secs(settings.timeout_secs))
        .build()?;
    let url = settings
        .url
        .clone()
        .unwrap_or_else(|| settings.kind.default_url().to_string());

    Ok(match settings.kind {
        ExternalKind::Fetch => Arc::new(HttpFetch::new(client, url)),
        ExternalKind::ChatCompletions => {
            Arc::new(ChatCompletions::new(client, url, settings.model.clone()))
        }
    })
}

/// Plain HTTP call: GET when the input is empty, otherwise POST of the input.
/// Returns the response body.
#[derive(Debug, Clone)]
pub struct HttpFetch {
    client: Client,
    url: String,
}

impl HttpFetch {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ExternalService for HttpFetch {
    async fn call(&self, reply: &str, _request: &str) -> Result<String> {
        let request = if reply.is_empty() {
            self.client.get(&self.url)
        } else {
            self.client.post(&self.url).body(reply.to_string())
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(url = %self.url, %status, "External fetch completed");

        if !status.is_success() {
            return Err(Error::External(format!("{} returned {status}: {body}", self.url)));
        }
        Ok(body)
    }
}

/// Chat-completion call: the decoded reply is the bearer credential and the
/// request text is the single user message.
#[derive(Debug, Clone)]
pub struct ChatCompletions {
    client: Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl ChatCompletions {
    pub fn new(client: Client, url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            model: model.into(),
        }
    }
}

/// Extracts the first choice's content from a chat-completion response body.
fn first_choice(body: &str) -> Result<String> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| Error::External(format!("unexpected chat completion response: {e}")))?;
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| Error::External("chat completion returned no choices".to_string()))
}

#[async_trait]
impl ExternalService for ChatCompletions {
    async fn call(&self, reply: &str, request: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: request.to_string(),
            }],
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(reply.trim())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(Error::External(format!("chat completion failed with {status}: {text}")));
        }
        first_choice(&text)
    }
}
