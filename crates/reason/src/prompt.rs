//! Prompt construction
//!
//! The prompt is composed of a fixed system role, the formatted retrieval
//! context, and the running conversation messages.

use serde::{Deserialize, Serialize};

/// Fixed system role for the voice agent.
pub const SYSTEM_ROLE: &str = "You are a helpful real-time voice assistant. \
Answer briefly and conversationally; your reply will be spoken aloud. \
Use the prior conversation excerpts when they are relevant, and ignore them \
when they are not.";

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Build the message list for one reasoning pass.
pub fn build_messages(context: &[String], history: &[Message], utterance: &str) -> Vec<Message> {
    let system = if context.is_empty() {
        SYSTEM_ROLE.to_string()
    } else {
        let mut s = String::from(SYSTEM_ROLE);
        s.push_str("\n\nRelevant prior conversation:\n");
        for excerpt in context {
            s.push_str("- ");
            s.push_str(excerpt);
            s.push('\n');
        }
        s
    };

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system));
    messages.extend(history.iter().cloned());
    messages.push(Message::user(utterance));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_without_context() {
        let messages = build_messages(&[], &[], "hello");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, SYSTEM_ROLE);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "hello");
    }

    #[test]
    fn test_build_with_context_and_history() {
        let context = vec!["User: hi\nAgent: hello".to_string()];
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let messages = build_messages(&context, &history, "what time is it?");

        assert_eq!(messages.len(), 4);
        assert!(messages[0].content.contains("Relevant prior conversation"));
        assert!(messages[0].content.contains("User: hi"));
        assert_eq!(messages.last().unwrap().content, "what time is it?");
    }

    #[test]
    fn test_role_serialization() {
        let msg = Message::assistant("ok");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
