//! Bounded in-process conversation memory.
//!
//! Holds the user/assistant transcript handed to the generator on each
//! turn. The buffer is bounded (oldest messages drop first) and is cleared
//! wholesale on phase transitions. Writes happen only from the turn
//! processor, under the owning mutex, after the corresponding collaborator
//! call has succeeded, so a failed turn leaves no trace here.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Bounded transcript of prior turns.
#[derive(Debug)]
pub struct ConversationMemory {
    messages: VecDeque<ChatMessage>,
    max_messages: usize,
}

impl ConversationMemory {
    /// Create a memory bounded to `max_messages` entries.
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_messages: max_messages.max(2),
        }
    }

    /// Append a user utterance.
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Role::User, text.into());
    }

    /// Append an assistant utterance.
    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Role::Assistant, text.into());
    }

    fn push(&mut self, role: Role, content: String) {
        if content.trim().is_empty() {
            return;
        }
        self.messages.push_back(ChatMessage { role, content });
        while self.messages.len() > self.max_messages {
            let _ = self.messages.pop_front();
        }
    }

    /// Snapshot of the transcript, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when no messages are retained.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop the whole transcript (phase entry).
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn oldest_messages_drop_first() {
        let mut memory = ConversationMemory::new(4);
        for i in 0..6 {
            memory.push_user(format!("utterance {i}"));
        }
        let messages = memory.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "utterance 2");
        assert_eq!(messages[3].content, "utterance 5");
    }

    #[test]
    fn blank_messages_are_ignored() {
        let mut memory = ConversationMemory::new(8);
        memory.push_user("   ");
        memory.push_assistant("");
        assert!(memory.is_empty());
    }

    #[test]
    fn clear_empties_the_transcript() {
        let mut memory = ConversationMemory::new(8);
        memory.push_user("hello");
        memory.push_assistant("hi there");
        assert_eq!(memory.len(), 2);
        memory.clear();
        assert!(memory.is_empty());
    }
}
