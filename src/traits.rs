//! Collaborator traits consumed by the session engine.
//!
//! The engine never talks to a search index, a language model, or a log
//! sink directly. It is handed one implementation of each trait below and
//! drives a turn through them:
//!
//! ```text
//!   query ──▶ Retriever::search ──▶ source map ──▶ ChatModel::complete/stream
//!                                                           │
//!                  TurnLogger::log ◀── citations ◀──────────┘
//! ```
//!
//! Built-in implementations live in [`crate::retrieval`], [`crate::llm`] and
//! [`crate::turn_log`]. Tests substitute in-memory fakes.
//!
//! # Usage
//!
//! ```rust
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use rag_session::models::RetrievalHit;
//! use rag_session::traits::Retriever;
//!
//! pub struct FixedRetriever(Vec<RetrievalHit>);
//!
//! #[async_trait]
//! impl Retriever for FixedRetriever {
//!     fn name(&self) -> &str { "fixed" }
//!
//!     async fn search(&self, _query: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
//!         Ok(self.0.iter().take(top_k).cloned().collect())
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;

use crate::models::{CitedSource, GenerationSettings, Message, RetrievalHit, TurnStatus};

// ═══════════════════════════════════════════════════════════════════════
// Retriever Trait
// ═══════════════════════════════════════════════════════════════════════

/// A ranked-passage provider over some knowledge base.
///
/// Ranking is opaque to the engine: hits are consumed in the order given.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Short identifier used in logs (e.g. `"azure"`).
    fn name(&self) -> &str;

    /// Return at most `top_k` hits for `query`, best first.
    ///
    /// Errors are logged by the engine and treated as an empty result.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalHit>>;
}

// ═══════════════════════════════════════════════════════════════════════
// ChatModel Trait
// ═══════════════════════════════════════════════════════════════════════

/// One message in provider wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role.wire_role().to_string(),
            content: m.content.clone(),
        }
    }
}

/// A chat-completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub settings: GenerationSettings,
}

impl ChatRequest {
    /// Build a request from log messages. `summary` messages travel as
    /// `system`.
    pub fn new(messages: &[Message], settings: GenerationSettings) -> Self {
        Self {
            messages: messages.iter().map(ChatMessage::from).collect(),
            settings,
        }
    }
}

/// One event of a streaming completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatDelta {
    /// Next chunk of answer text.
    Text(String),
    /// Terminal event. Nothing follows it.
    Finished { finish_reason: Option<String> },
}

pub type ChatStream = BoxStream<'static, Result<ChatDelta>>;

/// A chat-completion provider.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use rag_session::traits::{ChatModel, ChatRequest};
///
/// pub struct Echo;
///
/// #[async_trait]
/// impl ChatModel for Echo {
///     fn name(&self) -> &str { "echo" }
///
///     async fn complete(&self, request: &ChatRequest) -> Result<String> {
///         Ok(request.messages.last().map(|m| m.content.clone()).unwrap_or_default())
///     }
/// }
/// ```
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model or deployment identifier used in logs.
    fn name(&self) -> &str;

    /// Run a completion and return the full answer text.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;

    /// Run a completion and yield the answer incrementally.
    ///
    /// The stream ends with [`ChatDelta::Finished`]. The default
    /// implementation delivers the result of [`complete`](ChatModel::complete)
    /// as a single chunk.
    async fn stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let text = self.complete(request).await?;
        let events = vec![
            Ok(ChatDelta::Text(text)),
            Ok(ChatDelta::Finished {
                finish_reason: Some("stop".to_string()),
            }),
        ];
        Ok(stream::iter(events).boxed())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// TurnLogger Trait
// ═══════════════════════════════════════════════════════════════════════

/// Everything recorded about one finished turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub session_id: String,
    pub query: String,
    pub answer: String,
    pub sources: Vec<CitedSource>,
    /// The context block sent to the model, or the no-context sentinel.
    pub context: String,
    pub status: TurnStatus,
    pub history_trimmed: bool,
    pub created_at: DateTime<Utc>,
}

/// Fire-and-forget sink for finished turns.
///
/// The engine calls [`log`](TurnLogger::log) from a spawned task; an error
/// is logged and otherwise ignored.
#[async_trait]
pub trait TurnLogger: Send + Sync {
    async fn log(&self, record: &TurnRecord) -> Result<()>;
}
