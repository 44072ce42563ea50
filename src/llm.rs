//! Chat-completion client for OpenAI and Azure OpenAI.
//!
//! Both providers speak the same Chat Completions wire format and differ only
//! in URL shape and authentication:
//!
//! | Flavor | URL | Auth header |
//! |--------|-----|-------------|
//! | `openai` | `{base_url}/v1/chat/completions` | `Authorization: Bearer …` |
//! | `azure`  | `{endpoint}/openai/deployments/{deployment}/chat/completions?api-version=…` | `api-key: …` |
//!
//! # Retry Strategy
//!
//! Same as the embedding client:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: `retry_backoff_ms`, doubled per attempt (capped at 2^5)
//!
//! A streaming request is only retried until the response headers arrive;
//! once events flow, errors end the stream.
//!
//! # Timeouts
//!
//! `timeout` bounds a whole non-streaming request. A streaming request is
//! bounded only until its headers arrive; after that the body may run as
//! long as chunks keep coming, with `timeout` as the longest allowed gap
//! between reads.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::traits::{ChatDelta, ChatModel, ChatRequest, ChatStream};

/// OpenAI-compatible chat-completion client.
#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    client: reqwest::Client,
    url: String,
    auth_header: &'static str,
    auth_value: String,
    /// Sent as `model` for the openai flavor; Azure routes by deployment.
    model: Option<String>,
    label: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl OpenAiChatModel {
    /// Client for `api.openai.com` or any compatible server at `base_url`.
    pub fn openai(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            auth_header: "Authorization",
            auth_value: format!("Bearer {}", api_key),
            model: Some(model.to_string()),
            label: model.to_string(),
            timeout,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        })
    }

    /// Client for an Azure OpenAI deployment.
    pub fn azure(
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
            auth_header: "api-key",
            auth_value: api_key.to_string(),
            model: None,
            label: deployment.to_string(),
            timeout,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Build a client from `[generation]`, reading the key from the
    /// configured environment variable.
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let key_var = config.api_key_var();
        let api_key =
            std::env::var(key_var).map_err(|_| anyhow!("{} not set", key_var))?;
        let timeout = Duration::from_secs(config.timeout_secs);

        let model = match config.provider.as_str() {
            "openai" => {
                let model = config
                    .model
                    .as_deref()
                    .ok_or_else(|| anyhow!("generation.model required"))?;
                Self::openai(&config.base_url, &api_key, model, timeout)?
            }
            "azure" => {
                let endpoint = config
                    .endpoint
                    .as_deref()
                    .ok_or_else(|| anyhow!("generation.endpoint required"))?;
                let deployment = config
                    .deployment
                    .as_deref()
                    .ok_or_else(|| anyhow!("generation.deployment required"))?;
                Self::azure(
                    endpoint,
                    deployment,
                    &config.api_version,
                    &api_key,
                    timeout,
                )?
            }
            other => bail!("Unknown generation provider: '{}'", other),
        };

        Ok(model.with_retries(
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
        ))
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        let s = &request.settings;
        let mut body = json!({
            "messages": request.messages,
            "temperature": s.temperature,
            "max_tokens": s.max_tokens,
            "top_p": s.top_p,
            "presence_penalty": s.presence_penalty,
            "frequency_penalty": s.frequency_penalty,
            "stream": stream,
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        body
    }

    /// POST `body`, retrying transient failures. Returns a successful response.
    ///
    /// With `streaming` the deadline covers the wait for headers only.
    async fn send(&self, body: &Value, streaming: bool) -> Result<reqwest::Response> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.retry_backoff * (1u32 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, "retrying chat completion");
                tokio::time::sleep(delay).await;
            }

            let builder = self
                .client
                .post(&self.url)
                .header(self.auth_header, &self.auth_value)
                .header("Content-Type", "application/json")
                .json(body);

            let resp = if streaming {
                match tokio::time::timeout(self.timeout, builder.send()).await {
                    Ok(resp) => resp,
                    Err(_) => {
                        tracing::warn!(
                            attempt,
                            timeout = ?self.timeout,
                            "no response headers before deadline"
                        );
                        last_err = Some(anyhow!(
                            "Chat API sent no response within {:?}",
                            self.timeout
                        ));
                        continue;
                    }
                }
            } else {
                builder.timeout(self.timeout).send().await
            };

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(%status, attempt, "chat completion failed, will retry");
                        last_err = Some(anyhow!("Chat API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429), no retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Chat API error {}: {}", status, body_text);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "chat completion request failed");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Chat completion failed after retries")))
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let response = self.send(&self.body(request, false), false).await?;
        let json: Value = response
            .json()
            .await
            .context("Chat API returned invalid JSON")?;
        parse_completion(&json)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let response = self.send(&self.body(request, true), true).await?;
        let mut events = response.bytes_stream().eventsource();

        let stream = async_stream::try_stream! {
            let mut finish_reason: Option<String> = None;
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| anyhow!("SSE stream error: {}", e))?;
                if event.data == "[DONE]" {
                    break;
                }
                let json: Value = serde_json::from_str(&event.data)
                    .with_context(|| format!("SSE parsing error, data: {}", event.data))?;
                check_stream_error(&json)?;
                let (text, reason) = parse_chunk(&json);
                if let Some(reason) = reason {
                    finish_reason = Some(reason);
                }
                if let Some(text) = text {
                    if !text.is_empty() {
                        yield ChatDelta::Text(text);
                    }
                }
            }
            yield ChatDelta::Finished { finish_reason };
        };

        Ok(stream.boxed())
    }
}

/// Client without a whole-request timeout; see the module docs.
fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()?)
}

/// Extract `choices[0].message.content` from a completion response.
fn parse_completion(json: &Value) -> Result<String> {
    if let Some(message) = sse_error_message(json) {
        bail!("Chat API error: {}", message);
    }
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Chat API response has no message content"))
}

/// Delta text and finish reason of one streamed chunk.
fn parse_chunk(json: &Value) -> (Option<String>, Option<String>) {
    let choice = json.get("choices").and_then(|c| c.get(0));
    let text = choice
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string);
    let reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
        .map(str::to_string);
    (text, reason)
}

fn check_stream_error(json: &Value) -> Result<()> {
    match sse_error_message(json) {
        Some(message) => bail!("SSE API error: {}", message),
        None => Ok(()),
    }
}

fn sse_error_message(json: &Value) -> Option<String> {
    let error = json.get("error")?;
    if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("unknown provider error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerationSettings, Message};

    #[test]
    fn test_parse_completion() {
        let json = json!({
            "choices": [{ "message": { "role": "assistant", "content": "The X200 [1]." } }]
        });
        assert_eq!(parse_completion(&json).unwrap(), "The X200 [1].");
    }

    #[test]
    fn test_parse_completion_surfaces_error_object() {
        let json = json!({ "error": { "message": "content filtered" } });
        let err = parse_completion(&json).unwrap_err().to_string();
        assert!(err.contains("content filtered"));
    }

    #[test]
    fn test_parse_chunk() {
        let json = json!({
            "object": "chat.completion.chunk",
            "choices": [{ "delta": { "content": "Hel" }, "finish_reason": null }]
        });
        assert_eq!(parse_chunk(&json), (Some("Hel".to_string()), None));

        let json = json!({ "choices": [{ "delta": {}, "finish_reason": "stop" }] });
        assert_eq!(parse_chunk(&json), (None, Some("stop".to_string())));
    }

    #[test]
    fn test_azure_url_and_body_without_model() {
        let model = OpenAiChatModel::azure(
            "https://res.openai.azure.com/",
            "gpt4o",
            "2024-06-01",
            "k",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            model.url,
            "https://res.openai.azure.com/openai/deployments/gpt4o/chat/completions?api-version=2024-06-01"
        );
        let req = ChatRequest::new(&[Message::user("q")], GenerationSettings::default());
        let body = model.body(&req, false);
        assert!(body.get("model").is_none());
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
