//! Model-backed [`Summarizer`].
//!
//! Sends the messages being compacted to a [`ChatModel`] with an instruction
//! that demands verbatim preservation of citation markers and product/model
//! tokens. Marker continuity is additionally enforced by the window, which
//! appends any marker the model dropped.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::SummarizationConfig;
use crate::models::{GenerationSettings, Message};
use crate::prompts::{summary_request, SUMMARY_SYSTEM_PROMPT};
use crate::traits::{ChatModel, ChatRequest};
use crate::window::{collect_markers, Summarizer};

pub struct ModelSummarizer {
    model: Arc<dyn ChatModel>,
    settings: GenerationSettings,
}

impl ModelSummarizer {
    pub fn new(model: Arc<dyn ChatModel>, config: &SummarizationConfig) -> Self {
        Self {
            model,
            settings: GenerationSettings {
                temperature: config.temperature,
                max_tokens: config.max_summary_tokens,
                top_p: 1.0,
                presence_penalty: 0.0,
                frequency_penalty: 0.0,
            },
        }
    }

    /// The request sent for `messages`.
    pub fn request(&self, messages: &[Message]) -> ChatRequest {
        let markers = collect_markers(messages);
        ChatRequest::new(
            &[
                Message::system(SUMMARY_SYSTEM_PROMPT),
                Message::user(summary_request(messages, &markers)),
            ],
            self.settings,
        )
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        tracing::debug!(
            messages = messages.len(),
            model = self.model.name(),
            "summarizing conversation history"
        );
        let summary = self.model.complete(&self.request(messages)).await?;
        Ok(summary.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl ChatModel for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn complete(&self, request: &ChatRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            Ok("  The user asked about the P-40 pump [1].  ".to_string())
        }
    }

    #[tokio::test]
    async fn test_summary_request_shape() {
        let model = Arc::new(Recording::default());
        let summarizer = ModelSummarizer::new(model.clone(), &SummarizationConfig::default());
        let messages = vec![
            Message::user("which pump handles 40 bar?"),
            Message::assistant("The P-40 [1] and the P-45 [3]."),
        ];

        let summary = summarizer.summarize(&messages).await.unwrap();
        assert_eq!(summary, "The user asked about the P-40 pump [1].");

        let seen = model.seen.lock().unwrap();
        let req = &seen[0];
        assert_eq!(req.settings.max_tokens, 800);
        assert_eq!(req.settings.temperature, 0.3);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[0].content, SUMMARY_SYSTEM_PROMPT);
        assert!(req.messages[1].content.contains("ASSISTANT: The P-40 [1] and the P-45 [3]."));
        assert!(req.messages[1].content.ends_with("[1], [3]"));
    }
}
