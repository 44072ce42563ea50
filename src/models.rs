//! Core data models used throughout the session engine.
//!
//! These types represent the messages, retrieval hits, and citation records
//! that flow through one conversational turn.

use serde::{Deserialize, Serialize};

/// Speaker of a [`Message`] in the conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Compressed stand-in for older turns, produced by compaction.
    Summary,
}

impl Role {
    /// Role name understood by chat-completion providers.
    ///
    /// Providers have no `summary` role, so summaries travel as `system`.
    pub fn wire_role(&self) -> &'static str {
        match self {
            Role::System | Role::Summary => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Summary => "summary",
        }
    }
}

/// One entry of a session's conversation log.
///
/// `content` may carry `[n]` citation markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self::new(Role::Summary, content)
    }
}

/// A ranked passage returned by a retrieval provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub text: String,
    pub title: String,
    /// Opaque provenance handle of the parent document.
    pub parent_id: String,
    pub relevance: f64,
}

/// A numbered, citable passage of the current turn.
///
/// Lives for one turn only: built by the source map builder and consumed by
/// the citation resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// `"1"`..`"5"` in retrieval order.
    pub id: String,
    pub title: String,
    pub normalized_text: String,
    pub parent_id: String,
}

/// A source the final answer actually used, densely renumbered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitedSource {
    /// `"1"`..`"N"` in first-appearance order.
    pub id: String,
    pub title: String,
    pub content: String,
    pub parent_id: String,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Generation ran and the turn was committed to the session.
    Answered,
    /// Retrieval produced nothing usable; generation was skipped.
    NoContext,
    /// The generation provider failed or timed out; the session is unchanged.
    GenerationFailed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Answered => "answered",
            TurnStatus::NoContext => "no_context",
            TurnStatus::GenerationFailed => "generation_failed",
        }
    }
}

/// Sampling parameters forwarded to the generation provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1000,
            top_p: 1.0,
            presence_penalty: 0.6,
            frequency_penalty: 0.6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_travels_as_system() {
        assert_eq!(Role::Summary.wire_role(), "system");
        assert_eq!(Role::Summary.as_str(), "summary");
        assert_eq!(Role::User.wire_role(), "user");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = Message::summary("Previous conversation summary: x");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "summary");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_turn_status_names_match_serde() {
        for status in [
            TurnStatus::Answered,
            TurnStatus::NoContext,
            TurnStatus::GenerationFailed,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
        }
    }
}
