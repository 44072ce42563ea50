//! Retriever implementations.
//!
//! | Provider | Backend |
//! |----------|---------|
//! | `azure`   | Azure AI Search REST API, text + optional vector query |
//! | `harness` | A running `context-harness` server, via `POST /tools/search` |
//! | `static`  | A JSON corpus on disk, ranked by query-term overlap |
//!
//! Use [`create_retriever`] to build the one selected by `[retrieval]`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingClient;
use crate::models::RetrievalHit;
use crate::traits::Retriever;

const UNTITLED: &str = "Untitled";

/// Build the retriever selected by `config.provider`.
pub fn create_retriever(config: &RetrievalConfig) -> Result<Arc<dyn Retriever>> {
    match config.provider.as_str() {
        "azure" => Ok(Arc::new(AzureSearchRetriever::from_config(config)?)),
        "harness" => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("retrieval.url required"))?;
            Ok(Arc::new(HarnessRetriever::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        "static" => {
            let path = config
                .corpus
                .as_deref()
                .ok_or_else(|| anyhow!("retrieval.corpus required"))?;
            Ok(Arc::new(StaticRetriever::load(path)?))
        }
        other => anyhow::bail!("Unknown retrieval provider: {}", other),
    }
}

// ============ Azure AI Search ============

/// Field names of the search index.
#[derive(Debug, Clone)]
pub struct IndexFields {
    pub text: String,
    pub title: String,
    pub parent: String,
    pub vector: String,
}

impl Default for IndexFields {
    fn default() -> Self {
        Self {
            text: "chunk".to_string(),
            title: "title".to_string(),
            parent: "parent_id".to_string(),
            vector: "text_vector".to_string(),
        }
    }
}

pub struct AzureSearchRetriever {
    client: reqwest::Client,
    url: String,
    api_key: String,
    fields: IndexFields,
    embeddings: Option<EmbeddingClient>,
}

impl AzureSearchRetriever {
    pub fn new(
        endpoint: &str,
        index: &str,
        api_version: &str,
        api_key: &str,
        fields: IndexFields,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: format!(
                "{}/indexes/{}/docs/search?api-version={}",
                endpoint.trim_end_matches('/'),
                index,
                api_version
            ),
            api_key: api_key.to_string(),
            fields,
            embeddings: None,
        })
    }

    /// Add a vector query built from `client` to every search.
    pub fn with_embeddings(mut self, client: Option<EmbeddingClient>) -> Self {
        self.embeddings = client;
        self
    }

    pub fn from_config(config: &RetrievalConfig) -> Result<Self> {
        let key_var = config.api_key_var();
        let api_key = std::env::var(key_var).map_err(|_| anyhow!("{} not set", key_var))?;
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("retrieval.endpoint required"))?;
        let index = config
            .index
            .as_deref()
            .ok_or_else(|| anyhow!("retrieval.index required"))?;

        let fields = IndexFields {
            text: config.text_field.clone(),
            title: config.title_field.clone(),
            parent: config.parent_field.clone(),
            vector: config.vector_field.clone(),
        };

        Ok(Self::new(
            endpoint,
            index,
            &config.api_version,
            &api_key,
            fields,
            Duration::from_secs(config.timeout_secs),
        )?
        .with_embeddings(EmbeddingClient::from_config(&config.embedding)?))
    }

    async fn request_body(&self, query: &str, top_k: usize) -> Value {
        let f = &self.fields;
        let mut body = json!({
            "search": query,
            "top": top_k,
            "select": format!("{},{},{}", f.text, f.title, f.parent),
        });

        if let Some(embeddings) = &self.embeddings {
            match embeddings.embed_query(query).await {
                Ok(vector) => {
                    body["vectorQueries"] = json!([{
                        "kind": "vector",
                        "vector": vector,
                        "k": top_k,
                        "fields": f.vector,
                    }]);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "query embedding failed, using text search only");
                }
            }
        }
        body
    }
}

#[async_trait]
impl Retriever for AzureSearchRetriever {
    fn name(&self) -> &str {
        "azure"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
        let body = self.request_body(query, top_k).await;

        let response = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Azure Search request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Azure Search error {}: {}", status, text);
        }

        let json: Value = response.json().await?;
        let hits = parse_azure_hits(&json, &self.fields, top_k)?;
        tracing::debug!(hits = hits.len(), "azure search returned");
        Ok(hits)
    }
}

fn parse_azure_hits(json: &Value, fields: &IndexFields, top_k: usize) -> Result<Vec<RetrievalHit>> {
    let values = json
        .get("value")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("Invalid Azure Search response: missing value array"))?;

    Ok(values
        .iter()
        .take(top_k)
        .map(|doc| RetrievalHit {
            text: string_field(doc, &fields.text).unwrap_or_default(),
            title: string_field(doc, &fields.title)
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| UNTITLED.to_string()),
            parent_id: string_field(doc, &fields.parent).unwrap_or_default(),
            relevance: doc
                .get("@search.score")
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0),
        })
        .collect())
}

fn string_field(doc: &Value, name: &str) -> Option<String> {
    doc.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

// ============ context-harness ============

/// Retriever backed by a context-harness server's search tool.
pub struct HarnessRetriever {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct HarnessEnvelope {
    result: HarnessResults,
}

#[derive(Deserialize)]
struct HarnessResults {
    results: Vec<HarnessItem>,
}

#[derive(Deserialize)]
struct HarnessItem {
    id: String,
    score: f64,
    title: Option<String>,
    snippet: String,
}

impl HarnessRetriever {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: format!("{}/tools/search", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Retriever for HarnessRetriever {
    fn name(&self) -> &str {
        "harness"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query, "mode": "hybrid", "limit": top_k }))
            .send()
            .await
            .context("context-harness request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("context-harness error {}: {}", status, text);
        }

        let envelope: HarnessEnvelope = response
            .json()
            .await
            .context("Invalid context-harness search response")?;

        Ok(envelope
            .result
            .results
            .into_iter()
            .take(top_k)
            .map(|item| RetrievalHit {
                text: item.snippet,
                title: item
                    .title
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| UNTITLED.to_string()),
                parent_id: item.id,
                relevance: item.score,
            })
            .collect())
    }
}

// ============ Static corpus ============

/// One passage of a static corpus file.
#[derive(Debug, Clone, Deserialize)]
pub struct CorpusEntry {
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// In-memory corpus ranked by the number of distinct query terms a passage
/// contains. Passages sharing no term with the query are not returned.
pub struct StaticRetriever {
    entries: Vec<CorpusEntry>,
}

impl StaticRetriever {
    pub fn new(entries: Vec<CorpusEntry>) -> Self {
        Self { entries }
    }

    /// Load a JSON array of `{ "text", "title", "parent_id" }` objects.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;
        let entries: Vec<CorpusEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse corpus file: {}", path.display()))?;
        tracing::info!(passages = entries.len(), path = %path.display(), "loaded static corpus");
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl Retriever for StaticRetriever {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, &CorpusEntry)> = self
            .entries
            .iter()
            .map(|entry| {
                let overlap = terms(&entry.text).intersection(&query_terms).count();
                (overlap, entry)
            })
            .filter(|(overlap, _)| *overlap > 0)
            .collect();
        // stable sort keeps corpus order among ties
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let total = query_terms.len() as f64;
        Ok(scored
            .into_iter()
            .take(top_k)
            .enumerate()
            .map(|(i, (overlap, entry))| RetrievalHit {
                text: entry.text.clone(),
                title: entry
                    .title
                    .clone()
                    .unwrap_or_else(|| UNTITLED.to_string()),
                parent_id: entry
                    .parent_id
                    .clone()
                    .unwrap_or_else(|| format!("static-{}", i)),
                relevance: overlap as f64 / total,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> StaticRetriever {
        StaticRetriever::new(vec![
            CorpusEntry {
                text: "The P-40 pump delivers 40 bar.".to_string(),
                title: Some("P-40".to_string()),
                parent_id: Some("doc-p40".to_string()),
            },
            CorpusEntry {
                text: "Valve maintenance schedule.".to_string(),
                title: None,
                parent_id: None,
            },
            CorpusEntry {
                text: "The P-45 pump delivers 45 bar and runs quietly.".to_string(),
                title: Some("P-45".to_string()),
                parent_id: Some("doc-p45".to_string()),
            },
        ])
    }

    #[tokio::test]
    async fn test_static_ranks_by_overlap() {
        let hits = corpus().search("quietly running pump bar", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "P-45");
        assert_eq!(hits[1].title, "P-40");
        assert!(hits[0].relevance > hits[1].relevance);
    }

    #[tokio::test]
    async fn test_static_no_overlap_is_empty() {
        let hits = corpus().search("weather forecast", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_static_untitled_and_top_k() {
        let hits = corpus().search("valve pump", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        let hits = corpus().search("valve", 5).await.unwrap();
        assert_eq!(hits[0].title, UNTITLED);
    }

    #[test]
    fn test_parse_azure_hits() {
        let json = json!({
            "value": [
                { "@search.score": 2.5, "chunk": "Alpha.", "title": "A", "parent_id": "pa" },
                { "@search.score": 1.0, "chunk": "Beta.", "parent_id": "pb" }
            ]
        });
        let hits = parse_azure_hits(&json, &IndexFields::default(), 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "Alpha.");
        assert_eq!(hits[0].relevance, 2.5);
        assert_eq!(hits[1].title, "Untitled");
        assert_eq!(hits[1].parent_id, "pb");
    }
}
