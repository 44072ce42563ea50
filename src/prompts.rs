//! Prompt text and message framing.
//!
//! Everything the engine says to the model that is not user content lives
//! here: the default citation instructions, the context/query envelope, the
//! summarization instruction, and the query-rewrite instruction.

use crate::config::{PromptConfig, PromptMode};
use crate::models::Message;

/// Built-in system prompt.
///
/// Asks for inline `[id]` citations that refer only to `<source id="…">`
/// tags of the current turn.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a knowledgeable assistant that answers questions using the provided knowledge base context.

Guidelines:
1. Base your answer on the information inside <source id=\"...\"> tags in the <context> block.
2. Cite sources inline with their id in square brackets, e.g. [1] or [2][3], directly after the statement they support.
3. Only use ids that appear in <source id=\"...\"> tags of the current context. Never invent ids.
4. Keep citing sources in follow-up answers, even when the information was already discussed earlier.
5. If the context does not contain the answer, say so plainly instead of guessing.
6. Preserve exact product names, model numbers and technical values as they appear in the sources.";

/// Fixed answer for turns where retrieval produced nothing usable.
pub const NO_INFORMATION_ANSWER: &str = "No relevant information found in the knowledge base.";

/// Fixed answer for turns whose generation call failed.
pub const GENERATION_ERROR_ANSWER: &str = "I encountered an error while generating the response.";

pub const SUMMARY_SYSTEM_PROMPT: &str = "You create concise summaries that preserve technical details, product information, and citation references exactly as they appear in the original text.";

const SUMMARY_INSTRUCTION: &str = "\
Summarize the following conversation while:
1. Preserving ALL mentions of specific products, models, and technical details
2. Maintaining ALL citation references [X] in their original form
3. Keeping the key questions and answers
4. Focusing on technical information rather than conversational elements

Conversation to summarize:";

const QUERY_REWRITE_INSTRUCTION: &str = "\
Based on the following conversation history, please generate a concise and informative search query that captures what the user is looking for in their latest question. The query must be self-contained: resolve pronouns and references to earlier turns. Reply with the query only.";

/// Number of trailing log messages shown to the query rewriter.
pub const QUERY_REWRITE_HISTORY: usize = 5;

/// Resolve the configured system prompt.
pub fn system_prompt(config: &PromptConfig) -> String {
    match (config.system_prompt.as_deref().map(str::trim), config.mode) {
        (None, _) | (Some(""), _) => DEFAULT_SYSTEM_PROMPT.to_string(),
        (Some(custom), PromptMode::Override) => custom.to_string(),
        (Some(custom), PromptMode::Append) => format!("{}\n\n{}", custom, DEFAULT_SYSTEM_PROMPT),
    }
}

/// Wrap the retrieved context and the user query into one user message.
pub fn context_message(context: &str, query: &str, custom_prompt: Option<&str>) -> String {
    let query = match custom_prompt.map(str::trim) {
        Some(prefix) if !prefix.is_empty() => format!("{}\n\n{}", prefix, query),
        _ => query.to_string(),
    };
    format!(
        "<context>\n{}\n</context>\n<user_query>\n{}\n</user_query>",
        context, query
    )
}

/// The query part of a message built by [`context_message`]. Other text is
/// returned unchanged.
pub fn user_query_of(content: &str) -> &str {
    content
        .split_once("<user_query>\n")
        .and_then(|(_, rest)| rest.rsplit_once("\n</user_query>"))
        .map(|(query, _)| query)
        .unwrap_or(content)
}

/// User message of the summarization call.
///
/// `markers` lists the citation markers found in `messages`; the model is
/// reminded of them explicitly. Retrieved context is left out of user
/// messages.
pub fn summary_request(messages: &[Message], markers: &[String]) -> String {
    let mut out = String::from(SUMMARY_INSTRUCTION);
    for m in messages {
        out.push_str("\n\n");
        out.push_str(&m.role.as_str().to_uppercase());
        out.push_str(": ");
        out.push_str(user_query_of(&m.content));
    }
    if !markers.is_empty() {
        out.push_str(
            "\n\nIMPORTANT: Make sure to preserve these citation references in your summary: ",
        );
        out.push_str(&markers.join(", "));
    }
    out
}

/// User message of the query-rewrite call.
///
/// Retrieved context is stripped from earlier user messages.
pub fn query_rewrite_request(history: &[Message], query: &str) -> String {
    let start = history.len().saturating_sub(QUERY_REWRITE_HISTORY);
    let mut out = String::from(QUERY_REWRITE_INSTRUCTION);
    out.push_str("\n\nConversation history:");
    for m in &history[start..] {
        out.push_str(&format!("\n{}: {}", m.role.as_str(), user_query_of(&m.content)));
    }
    out.push_str(&format!("\n\nLatest question: {}\n\nSearch query:", query));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_modes() {
        let mut config = PromptConfig::default();
        assert_eq!(system_prompt(&config), DEFAULT_SYSTEM_PROMPT);

        config.system_prompt = Some("You support the Acme X200 line.".to_string());
        let appended = system_prompt(&config);
        assert!(appended.starts_with("You support the Acme X200 line.\n\n"));
        assert!(appended.ends_with(DEFAULT_SYSTEM_PROMPT));

        config.mode = PromptMode::Override;
        assert_eq!(system_prompt(&config), "You support the Acme X200 line.");
    }

    #[test]
    fn test_context_message_framing() {
        let msg = context_message("<source id=\"1\">a</source>", "what is a?", None);
        assert_eq!(
            msg,
            "<context>\n<source id=\"1\">a</source>\n</context>\n<user_query>\nwhat is a?\n</user_query>"
        );

        let msg = context_message("ctx", "q", Some("Answer in German."));
        assert!(msg.contains("<user_query>\nAnswer in German.\n\nq\n</user_query>"));
    }

    #[test]
    fn test_user_query_of_strips_context() {
        let framed = context_message("<source id=\"1\">x</source>", "how loud is it?", None);
        assert_eq!(user_query_of(&framed), "how loud is it?");
        assert_eq!(user_query_of("plain text"), "plain text");
    }

    #[test]
    fn test_summary_request_lists_markers() {
        let messages = vec![
            Message::user("which pump?"),
            Message::assistant("The P-40 [2] fits."),
        ];
        let text = summary_request(&messages, &["[2]".to_string()]);
        assert!(text.contains("\n\nUSER: which pump?"));
        assert!(text.contains("\n\nASSISTANT: The P-40 [2] fits."));
        assert!(text.ends_with("preserve these citation references in your summary: [2]"));
    }

    #[test]
    fn test_query_rewrite_uses_recent_history_only() {
        let history: Vec<Message> = (0..8).map(|i| Message::user(format!("m{}", i))).collect();
        let text = query_rewrite_request(&history, "and its weight?");
        assert!(!text.contains("user: m2\n"));
        assert!(text.contains("user: m3"));
        assert!(text.contains("user: m7"));
        assert!(text.contains("Latest question: and its weight?"));
    }
}
