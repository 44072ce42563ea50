//! Query embedding client for vector retrieval.
//!
//! Used by the Azure AI Search retriever to add a vector query next to the
//! text query. Speaks the OpenAI embeddings API against either OpenAI or an
//! Azure OpenAI deployment.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

use crate::config::EmbeddingConfig;

#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    client: reqwest::Client,
    url: String,
    auth_header: &'static str,
    auth_value: String,
    model: Option<String>,
    dims: Option<usize>,
    max_retries: u32,
    retry_base: Duration,
}

impl EmbeddingClient {
    pub fn openai(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
            auth_header: "Authorization",
            auth_value: format!("Bearer {}", api_key),
            model: Some(model.to_string()),
            dims: None,
            max_retries: 5,
            retry_base: Duration::from_secs(1),
        })
    }

    pub fn azure(
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: format!(
                "{}/openai/deployments/{}/embeddings?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
            auth_header: "api-key",
            auth_value: api_key.to_string(),
            model: None,
            dims: None,
            max_retries: 5,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Request vectors of exactly `dims` dimensions.
    pub fn with_dims(mut self, dims: Option<usize>) -> Self {
        self.dims = dims;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = base;
        self
    }

    /// Build a client from `[retrieval.embedding]`. Returns `None` when
    /// embeddings are disabled.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Option<Self>> {
        if !config.is_enabled() {
            return Ok(None);
        }

        let key_var = config.api_key_var();
        let api_key = std::env::var(key_var).map_err(|_| anyhow!("{} not set", key_var))?;
        let timeout = Duration::from_secs(config.timeout_secs);

        let client = match config.provider.as_str() {
            "openai" => {
                let model = config
                    .model
                    .as_deref()
                    .ok_or_else(|| anyhow!("retrieval.embedding.model required"))?;
                Self::openai(&config.base_url, &api_key, model, timeout)?
            }
            "azure" => {
                let endpoint = config
                    .endpoint
                    .as_deref()
                    .ok_or_else(|| anyhow!("retrieval.embedding.endpoint required"))?;
                let deployment = config
                    .deployment
                    .as_deref()
                    .ok_or_else(|| anyhow!("retrieval.embedding.deployment required"))?;
                Self::azure(endpoint, deployment, &config.api_version, &api_key, timeout)?
            }
            other => bail!("Unknown embedding provider: {}", other),
        };

        Ok(Some(
            client
                .with_dims(config.dims)
                .with_retries(config.max_retries, Duration::from_secs(1)),
        ))
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("Embedding response contained no vectors"))
    }

    /// Embed a batch of texts, retrying transient failures.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut body = serde_json::json!({ "input": texts });
        if let Some(model) = &self.model {
            body["model"] = serde_json::json!(model);
        }
        if let Some(dims) = self.dims {
            body["dimensions"] = serde_json::json!(dims);
        }

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = self.retry_base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.url)
                .header(self.auth_header, &self.auth_value)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embedding_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("Embedding API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }
}

/// Extract `data[].embedding` arrays, ordered by their `index` field.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid embedding response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid embedding response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
