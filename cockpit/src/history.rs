//! ConversationHistory - bounded, ordered log of exchanged messages.
//!
//! Append is the only mutator. Entries are immutable once stored, so readers
//! get cloned snapshots and never observe a half-written message.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use shared_types::{ChatMessage, ContextMessage, MessageRole, Mode};

use crate::config::DEFAULT_HISTORY_CAPACITY;

#[derive(Debug)]
pub struct ConversationHistory {
    capacity: usize,
    entries: Mutex<VecDeque<ChatMessage>>,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ConversationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ChatMessage>> {
        // Entries are only ever pushed or popped whole, a poisoned guard still
        // holds a consistent deque.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a new message, evicting the oldest entries beyond capacity.
    pub fn append(&self, role: MessageRole, content: impl Into<String>, mode: Mode) -> ChatMessage {
        let message = ChatMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            mode,
        };

        let mut entries = self.lock();
        entries.push_back(message.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        message
    }

    pub fn append_user(&self, content: impl Into<String>, mode: Mode) -> ChatMessage {
        self.append(MessageRole::User, content, mode)
    }

    pub fn append_assistant(&self, content: impl Into<String>, mode: Mode) -> ChatMessage {
        self.append(MessageRole::Assistant, content, mode)
    }

    pub fn append_system(&self, content: impl Into<String>, mode: Mode) -> ChatMessage {
        self.append(MessageRole::System, content, mode)
    }

    pub fn append_log(&self, content: impl Into<String>, mode: Mode) -> ChatMessage {
        self.append(MessageRole::Log, content, mode)
    }

    /// The last `limit` user/assistant messages in chronological order.
    pub fn recent_context(&self, limit: usize) -> Vec<ContextMessage> {
        let entries = self.lock();
        let mut context: Vec<ContextMessage> = entries
            .iter()
            .rev()
            .filter(|m| m.role.is_conversational())
            .take(limit)
            .map(|m| ContextMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        context.reverse();
        context
    }

    /// Full history, or its tail when `limit` is given.
    pub fn all(&self, limit: Option<usize>) -> Vec<ChatMessage> {
        let entries = self.lock();
        let skip = match limit {
            Some(limit) => entries.len().saturating_sub(limit),
            None => 0,
        };
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
