//! Conversation state: an append-only, role-tagged message history.
//!
//! The history is mutated from exactly two places: the submission path
//! appends user messages, and the event loop folds streamed fragments into
//! the trailing assistant message. Both run on the same logical thread, so
//! fold order is arrival order.

use serde::Serialize;

/// The author of a chat message. Serialized lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single chat message.
///
/// Immutable once its round completes; the one in-flight assistant message
/// grows by concatenation while its stream is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Ordered message history. Display order is also the order sent to the
/// completion endpoint as context. Messages are never reordered or removed.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    streaming: bool,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True while the trailing assistant message is still being extended
    /// by incoming fragments.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Append a user message. Callers submit only between rounds, so the
    /// trailing message is never in-flight here.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message {
            role: Role::User,
            content: content.into(),
        });
    }

    /// Fold one streamed fragment into the trailing assistant message.
    ///
    /// The first fragment of a round creates the in-flight message; every
    /// later fragment is concatenated onto it, never replacing earlier
    /// content.
    pub fn apply_delta(&mut self, fragment: &str) {
        if self.streaming {
            if let Some(last) = self.messages.last_mut() {
                last.content.push_str(fragment);
                return;
            }
        }
        self.messages.push(Message {
            role: Role::Assistant,
            content: fragment.to_string(),
        });
        self.streaming = true;
    }

    /// Seal the in-flight assistant message after a terminal stream event.
    ///
    /// Idempotent. A round that produced no fragments leaves the history
    /// untouched.
    pub fn finalize(&mut self) {
        self.streaming = false;
    }
}
