//! Bounded conversation window with summarization-based compaction.
//!
//! The window is an ordered message log whose index 0 is the system message
//! while the session is active. Each [`ConversationWindow::append_turn`]
//! appends a user/assistant pair and then checks the budget:
//!
//! ```text
//! len ≤ max_turns·2 + 1          within budget, nothing happens
//! len > max_turns·2 + 1          over budget, compaction policy applies
//!
//! Truncate:   [system] + last max_turns·2                 (lossy)
//! Summarize:  [system, summary(older)] + last max_turns·2
//!             └─ on summarizer error or timeout: Truncate
//! ```
//!
//! Summaries are produced by an injected [`Summarizer`] so the window never
//! talks to a model directly.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::citations::marker_ids;
use crate::models::{Message, Role};

/// Content prefix of every summary message.
pub const SUMMARY_PREFIX: &str = "Previous conversation summary: ";

/// Produces a compressed rendition of older conversation messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `messages`, preserving every `[n]` marker and every
    /// proper-noun, product, and model token.
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// What to do with messages that fall out of the window.
#[derive(Clone)]
pub enum CompactionPolicy {
    /// Keep the system message and the most recent turns; discard the rest.
    /// Facts and citation identity from discarded turns are lost.
    Truncate,
    /// Replace discarded messages with one summary message.
    Summarize {
        summarizer: Arc<dyn Summarizer>,
        /// Upper bound on the summarization call.
        timeout: Option<Duration>,
    },
}

impl std::fmt::Debug for CompactionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionPolicy::Truncate => f.write_str("Truncate"),
            CompactionPolicy::Summarize { timeout, .. } => f
                .debug_struct("Summarize")
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}

/// Window size plus compaction strategy, shared by all sessions of an engine.
#[derive(Debug, Clone)]
pub struct WindowPolicy {
    /// Number of user/assistant pairs kept verbatim.
    pub max_turns: usize,
    pub compaction: CompactionPolicy,
}

impl WindowPolicy {
    pub fn truncating(max_turns: usize) -> Self {
        Self {
            max_turns,
            compaction: CompactionPolicy::Truncate,
        }
    }

    pub fn summarizing(max_turns: usize, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            max_turns,
            compaction: CompactionPolicy::Summarize {
                summarizer,
                timeout: None,
            },
        }
    }
}

/// What one append did to the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionOutcome {
    pub compacted: bool,
    /// Net number of messages removed from the log.
    pub dropped: usize,
    /// A summary message was written.
    pub summarized: bool,
    /// Summarization was attempted and failed; the log was truncated instead.
    pub summary_failed: bool,
}

/// Ordered message log of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationWindow {
    messages: Vec<Message>,
}

impl ConversationWindow {
    /// Start a log holding only the system message.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_system(&self) -> bool {
        matches!(self.messages.first(), Some(m) if m.role == Role::System)
    }

    /// Number of completed user/assistant pairs currently in the log.
    pub fn turn_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }

    /// Reinstall the system message if index 0 is not one.
    ///
    /// Returns `true` when a message was inserted.
    pub fn ensure_system(&mut self, system_prompt: &str) -> bool {
        if self.has_system() {
            return false;
        }
        self.messages.insert(0, Message::system(system_prompt));
        true
    }

    /// Drop the history. With `preserve_system` the system message stays.
    pub fn clear(&mut self, preserve_system: bool) {
        if preserve_system && self.has_system() {
            self.messages.truncate(1);
        } else {
            self.messages.clear();
        }
    }

    /// Largest log length that needs no compaction.
    pub fn capacity(&self, max_turns: usize) -> usize {
        max_turns * 2 + self.head()
    }

    fn head(&self) -> usize {
        usize::from(self.has_system())
    }

    /// Append one completed turn and compact if the log is over budget.
    ///
    /// Never fails: a summarizer error degrades to truncation.
    pub async fn append_turn(
        &mut self,
        user: Message,
        assistant: Message,
        policy: &WindowPolicy,
    ) -> CompactionOutcome {
        self.messages.push(user);
        self.messages.push(assistant);

        let before = self.messages.len();
        let limit = self.capacity(policy.max_turns);
        if before <= limit {
            tracing::debug!(len = before, limit, "history within budget");
            return CompactionOutcome::default();
        }

        let head = self.head();
        let keep_from = before - policy.max_turns * 2;
        let mut outcome = CompactionOutcome {
            compacted: true,
            ..Default::default()
        };

        let summary = match &policy.compaction {
            CompactionPolicy::Truncate => None,
            CompactionPolicy::Summarize { .. } if keep_from <= head => None,
            CompactionPolicy::Summarize {
                summarizer,
                timeout,
            } => {
                let older = &self.messages[head..keep_from];
                match summarize_with_deadline(summarizer.as_ref(), older, *timeout).await {
                    Ok(text) => {
                        outcome.summarized = true;
                        Some(Message::summary(format!(
                            "{}{}",
                            SUMMARY_PREFIX,
                            preserve_markers(text.trim(), older)
                        )))
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            messages = older.len(),
                            "summarization failed, falling back to truncation"
                        );
                        outcome.summary_failed = true;
                        None
                    }
                }
            }
        };

        let kept = self.messages.split_off(keep_from);
        self.messages.truncate(head);
        if let Some(summary) = summary {
            self.messages.push(summary);
        }
        self.messages.extend(kept);

        outcome.dropped = before - self.messages.len();
        tracing::info!(
            before,
            after = self.messages.len(),
            dropped = outcome.dropped,
            summarized = outcome.summarized,
            summary_failed = outcome.summary_failed,
            "compacted conversation history"
        );
        outcome
    }
}

async fn summarize_with_deadline(
    summarizer: &dyn Summarizer,
    messages: &[Message],
    timeout: Option<Duration>,
) -> Result<String> {
    let text = match timeout {
        Some(limit) => tokio::time::timeout(limit, summarizer.summarize(messages))
            .await
            .map_err(|_| anyhow::anyhow!("summarization timed out after {:?}", limit))??,
        None => summarizer.summarize(messages).await?,
    };
    if text.trim().is_empty() {
        anyhow::bail!("summarizer returned an empty summary");
    }
    Ok(text)
}

/// Citation markers (`[n]`) of the answers and summaries in `messages`,
/// numerically sorted and deduplicated.
///
/// User messages are skipped: they carry the retrieved passages, whose text
/// may contain bracketed numbers that are not citations.
pub fn collect_markers(messages: &[Message]) -> Vec<String> {
    let mut ids = BTreeSet::new();
    for m in messages
        .iter()
        .filter(|m| matches!(m.role, Role::Assistant | Role::Summary))
    {
        for id in marker_ids(&m.content) {
            if let Ok(n) = id.parse::<u64>() {
                ids.insert(n);
            }
        }
    }
    ids.into_iter().map(|n| format!("[{}]", n)).collect()
}

/// Append any marker of `older` that the summary lost.
fn preserve_markers(summary: &str, older: &[Message]) -> String {
    let missing: Vec<String> = collect_markers(older)
        .into_iter()
        .filter(|marker| !summary.contains(marker.as_str()))
        .collect();
    if missing.is_empty() {
        return summary.to_string();
    }
    tracing::debug!(missing = missing.len(), "summary dropped citation markers");
    format!("{}\n\nReferences: {}", summary, missing.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSummarizer {
        calls: AtomicUsize,
        reply: String,
    }

    impl CountingSummarizer {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: reply.to_string(),
            })
        }
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            anyhow::bail!("model unavailable")
        }
    }

    struct StalledSummarizer;

    #[async_trait]
    impl Summarizer for StalledSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("too late".to_string())
        }
    }

    fn pair(n: usize) -> (Message, Message) {
        (
            Message::user(format!("question {}", n)),
            Message::assistant(format!("answer {} [{}]", n, n)),
        )
    }

    async fn feed(
        window: &mut ConversationWindow,
        policy: &WindowPolicy,
        n: usize,
    ) -> CompactionOutcome {
        let (u, a) = pair(n);
        window.append_turn(u, a, policy).await
    }

    #[tokio::test]
    async fn test_within_budget_is_untouched() {
        let mut w = ConversationWindow::new("sys");
        let policy = WindowPolicy::truncating(2);
        for n in 1..=2 {
            let outcome = feed(&mut w, &policy, n).await;
            assert!(!outcome.compacted);
        }
        assert_eq!(w.len(), 5);
        assert_eq!(w.turn_count(), 2);
    }

    #[tokio::test]
    async fn test_truncation_keeps_system_and_recent_pairs() {
        let mut w = ConversationWindow::new("sys");
        let policy = WindowPolicy::truncating(2);
        for n in 1..=2 {
            feed(&mut w, &policy, n).await;
        }
        let outcome = feed(&mut w, &policy, 3).await;
        assert!(outcome.compacted);
        assert!(!outcome.summarized);
        assert_eq!(outcome.dropped, 2);
        assert_eq!(w.len(), 5);
        assert_eq!(w.messages()[0], Message::system("sys"));
        assert_eq!(w.messages()[1].content, "question 2");
        assert_eq!(w.messages()[4].content, "answer 3 [3]");
    }

    #[tokio::test]
    async fn test_summarization_scenario_four_pairs() {
        let summarizer = CountingSummarizer::new("talked about pumps");
        let mut w = ConversationWindow::new("sys");
        let policy = WindowPolicy::summarizing(2, summarizer.clone());

        for n in 1..=2 {
            feed(&mut w, &policy, n).await;
        }
        let outcome = feed(&mut w, &policy, 3).await;
        assert!(outcome.summarized);
        assert_eq!(w.len(), 6);
        assert_eq!(w.messages()[0].role, Role::System);
        assert_eq!(w.messages()[1].role, Role::Summary);
        assert!(w.messages()[1].content.starts_with(SUMMARY_PREFIX));
        assert!(w.messages()[1].content.contains("[1]"));
        assert_eq!(w.messages()[2].content, "question 2");

        let outcome = feed(&mut w, &policy, 4).await;
        assert!(outcome.summarized);
        assert_eq!(w.len(), 6);
        let summary = &w.messages()[1].content;
        assert!(summary.contains("[1]") && summary.contains("[2]"));
        assert_eq!(w.messages()[2].content, "question 3");
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_length_bound_holds_for_every_append() {
        let summarizer = CountingSummarizer::new("s");
        for max_turns in 1..=4 {
            let mut w = ConversationWindow::new("sys");
            let policy = WindowPolicy::summarizing(max_turns, summarizer.clone());
            for n in 1..=12 {
                feed(&mut w, &policy, n).await;
                assert!(w.len() <= max_turns * 2 + 2);
                assert_eq!(w.messages()[0].role, Role::System);
                assert_eq!(w.messages().last().unwrap().role, Role::Assistant);
            }
        }
    }

    #[tokio::test]
    async fn test_summary_keeps_markers_the_model_dropped() {
        let summarizer = CountingSummarizer::new("a summary without references");
        let mut w = ConversationWindow::new("sys");
        let policy = WindowPolicy::summarizing(1, summarizer);
        w.append_turn(
            Message::user("q1"),
            Message::assistant("see [4] and [2]"),
            &policy,
        )
        .await;
        w.append_turn(Message::user("q2"), Message::assistant("ok"), &policy)
            .await;
        let summary = &w.messages()[1].content;
        assert!(summary.ends_with("References: [2], [4]"), "{}", summary);
    }

    #[tokio::test]
    async fn test_failed_summarization_falls_back_to_truncation() {
        let mut w = ConversationWindow::new("sys");
        let policy = WindowPolicy::summarizing(2, Arc::new(FailingSummarizer));
        for n in 1..=3 {
            feed(&mut w, &policy, n).await;
        }
        assert_eq!(w.len(), 5);
        assert!(w.messages().iter().all(|m| m.role != Role::Summary));
        let outcome = feed(&mut w, &policy, 4).await;
        assert!(outcome.compacted && outcome.summary_failed && !outcome.summarized);
        assert_eq!(w.messages()[1].content, "question 3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_summarization_times_out_to_truncation() {
        let mut w = ConversationWindow::new("sys");
        let policy = WindowPolicy {
            max_turns: 1,
            compaction: CompactionPolicy::Summarize {
                summarizer: Arc::new(StalledSummarizer),
                timeout: Some(Duration::from_secs(5)),
            },
        };
        feed(&mut w, &policy, 1).await;
        let outcome = feed(&mut w, &policy, 2).await;
        assert!(outcome.summary_failed);
        assert_eq!(w.len(), 3);
    }

    #[tokio::test]
    async fn test_clear_preserving_system() {
        let mut w = ConversationWindow::new("sys");
        let policy = WindowPolicy::truncating(3);
        feed(&mut w, &policy, 1).await;
        w.clear(true);
        assert_eq!(w.messages(), &[Message::system("sys")]);
        w.clear(false);
        assert!(w.is_empty());
        assert!(w.ensure_system("restored"));
        assert!(!w.ensure_system("again"));
        assert_eq!(w.messages()[0].content, "restored");
    }

    #[test]
    fn test_collect_markers_sorted_and_unique() {
        let msgs = vec![
            Message::assistant("x [10] y [2] z [2]"),
            Message::summary("[1] and [not] and []"),
        ];
        assert_eq!(collect_markers(&msgs), vec!["[1]", "[2]", "[10]"]);
    }

    #[test]
    fn test_collect_markers_ignores_retrieved_passages() {
        let msgs = vec![
            Message::user(
                "<context>\n<source id=\"1\">\nSee table [12] in the manual.\n</source>\n</context>\n\n<user_query>\nwhich pump?\n</user_query>",
            ),
            Message::assistant("The P-40 [1]."),
        ];
        assert_eq!(collect_markers(&msgs), vec!["[1]"]);
    }

    #[tokio::test]
    async fn test_summary_references_skip_passage_numbers() {
        let summarizer = CountingSummarizer::new("Pumps were discussed.");
        let policy = WindowPolicy {
            max_turns: 1,
            compaction: CompactionPolicy::Summarize {
                summarizer: summarizer.clone(),
                timeout: None,
            },
        };
        let mut w = ConversationWindow::new("sys");
        w.append_turn(
            Message::user("<context>\nFigure [12] shows the curve.\n</context>\n\n<user_query>\nq1\n</user_query>"),
            Message::assistant("It peaks at 40 bar [1]."),
            &policy,
        )
        .await;
        let outcome = w
            .append_turn(Message::user("q2"), Message::assistant("a2"), &policy)
            .await;

        assert!(outcome.summarized);
        let summary = &w.messages()[1].content;
        assert!(summary.ends_with("References: [1]"), "{}", summary);
        assert!(!summary.contains("[12]"));
    }
}
