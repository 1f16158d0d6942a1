//! Conversation → search query.

use anyhow::Result;

use aiha_core::models::{ChatMessage, Role};
use aiha_core::prompt::QUERY_REWRITE_PROMPT;

use crate::generation::{ChatModel, CompletionRequest};

const REWRITE_TEMPERATURE: f32 = 0.1;

/// Render the history the rewriter sees: one `role: content` line per
/// message, without a leading assistant greeting.
pub fn conversation_history(messages: &[ChatMessage]) -> String {
    let cleaned = match messages.first() {
        Some(first) if first.role == Role::Assistant => &messages[1..],
        _ => messages,
    };
    cleaned
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Condense a conversation into one standalone search query.
///
/// An empty conversation yields an empty query without calling the model.
/// If the model answers with nothing, the last user message is used as the
/// query so a non-empty conversation always searches for something.
pub async fn generate_search_query(chat: &dyn ChatModel, messages: &[ChatMessage]) -> Result<String> {
    if messages.is_empty() {
        return Ok(String::new());
    }
    let history = conversation_history(messages);
    if history.trim().is_empty() {
        return Ok(String::new());
    }

    let rewritten = chat
        .complete(CompletionRequest {
            system: Some(QUERY_REWRITE_PROMPT.to_string()),
            messages: vec![ChatMessage::user(history.clone())],
            web_search: false,
            temperature: REWRITE_TEMPERATURE,
        })
        .await?;
    let rewritten = rewritten.trim();
    if !rewritten.is_empty() {
        return Ok(rewritten.to_string());
    }

    let fallback = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User && !m.content.trim().is_empty())
        .map(|m| m.content.trim().to_string())
        .unwrap_or_else(|| history.trim().to_string());
    tracing::debug!("query rewriter returned nothing, using last user message");
    Ok(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::TextStream;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        reply: String,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.into(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, request: CompletionRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request);
            Ok(self.reply.clone())
        }
        async fn stream(&self, _request: CompletionRequest) -> Result<TextStream> {
            anyhow::bail!("not used")
        }
    }

    #[test]
    fn test_history_drops_leading_assistant() {
        let msgs = vec![
            ChatMessage::assistant("Hi! Ask me anything."),
            ChatMessage::user("How do I reset the pump?"),
        ];
        assert_eq!(conversation_history(&msgs), "user: How do I reset the pump?");
    }

    #[tokio::test]
    async fn test_empty_conversation_skips_model() {
        let model = Scripted::new("ignored");
        assert_eq!(generate_search_query(&model, &[]).await.unwrap(), "");
        assert!(model.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_request_shape() {
        let model = Scripted::new("  pump reset procedure \n");
        let msgs = vec![
            ChatMessage::user("pump"),
            ChatMessage::assistant("Which pump?"),
            ChatMessage::user("the main one, how to reset"),
        ];
        let q = generate_search_query(&model, &msgs).await.unwrap();
        assert_eq!(q, "pump reset procedure");

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].system.as_deref(), Some(QUERY_REWRITE_PROMPT));
        assert!((seen[0].temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(
            seen[0].messages[0].content,
            "user: pump\nassistant: Which pump?\nuser: the main one, how to reset"
        );
    }

    #[tokio::test]
    async fn test_empty_model_output_falls_back_to_last_user_message() {
        let model = Scripted::new("   ");
        let msgs = vec![ChatMessage::user("first"), ChatMessage::user("valve specs")];
        assert_eq!(generate_search_query(&model, &msgs).await.unwrap(), "valve specs");
    }

    #[tokio::test]
    async fn test_empty_model_output_without_user_message_uses_history() {
        let model = Scripted::new("");
        let msgs = vec![
            ChatMessage::assistant("Hi! Ask me anything."),
            ChatMessage::assistant("Still here."),
        ];
        let q = generate_search_query(&model, &msgs).await.unwrap();
        assert_eq!(q, "assistant: Still here.");
        assert_eq!(model.seen.lock().unwrap()[0].messages[0].content, q);
    }
}
