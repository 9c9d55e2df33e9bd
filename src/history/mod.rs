//! Per-conversation chat history.
//!
//! Entries are keyed by model name and a caller-owned [`ConversationHandle`],
//! never by message content: two handles with identical messages are two
//! conversations. Entries live until cleared.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::api::types::{ChatResponse, Message, Role};
use crate::error::Result;
use crate::utils::{deserialize_conversation, serialize_conversation};

/// Opaque token naming one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationHandle(Uuid);

impl ConversationHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub model: String,
    pub handle: ConversationHandle,
}

impl ConversationKey {
    pub fn new(model: impl Into<String>, handle: ConversationHandle) -> Self {
        Self {
            model: model.into(),
            handle,
        }
    }
}

/// Shared history map. The lock only guards the map itself; concurrent
/// exchanges on the same key may interleave their messages.
#[derive(Debug, Default)]
pub struct ConversationStore {
    entries: Mutex<HashMap<ConversationKey, Vec<Message>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends every message not already present, keeping arrival order.
    pub fn merge(&self, key: &ConversationKey, messages: &[Message]) {
        let mut entries = self.entries.lock();
        let history = entries.entry(key.clone()).or_default();
        for message in messages {
            if !history.contains(message) {
                history.push(message.clone());
            }
        }
    }

    pub fn append(&self, key: &ConversationKey, message: Message) {
        self.entries
            .lock()
            .entry(key.clone())
            .or_default()
            .push(message);
    }

    pub fn history(&self, key: &ConversationKey) -> Vec<Message> {
        self.entries.lock().get(key).cloned().unwrap_or_default()
    }

    /// Empties an entry. Returns `false` when the key was never seen.
    pub fn clear(&self, key: &ConversationKey) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(history) => {
                history.clear();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn export(&self, key: &ConversationKey) -> Value {
        serialize_conversation(&key.model, &self.history(key))
    }

    /// Seeds a fresh conversation from an exported document.
    pub fn import(&self, model: &str, data: &Value) -> Result<ConversationHandle> {
        let messages = deserialize_conversation(data)?;
        let handle = ConversationHandle::new();
        self.entries
            .lock()
            .insert(ConversationKey::new(model, handle), messages);
        Ok(handle)
    }
}

/// Collects the assistant side of one exchange and commits it once.
pub struct Transcript {
    store: Arc<ConversationStore>,
    key: ConversationKey,
    content: String,
    tool_calls: Vec<Value>,
    committed: bool,
}

impl Transcript {
    pub(crate) fn new(store: Arc<ConversationStore>, key: ConversationKey) -> Self {
        Self {
            store,
            key,
            content: String::new(),
            tool_calls: Vec::new(),
            committed: false,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Buffered exchange: the response message is the assistant turn.
    pub fn commit_response(&mut self, response: &ChatResponse) {
        if self.committed {
            return;
        }
        if let Some(message) = &response.message {
            self.store.append(&self.key, message.clone());
            self.committed = true;
        }
    }

    /// Streamed exchange: accumulate every frame, commit on the terminal one.
    pub fn observe(&mut self, frame: &ChatResponse) {
        if self.committed {
            return;
        }
        if let Some(message) = &frame.message {
            self.content.push_str(&message.content);
            if let Some(calls) = &message.tool_calls {
                self.tool_calls.extend(calls.iter().cloned());
            }
        }
        if frame.done {
            let mut message = Message::new(Role::Assistant, std::mem::take(&mut self.content));
            if !self.tool_calls.is_empty() {
                message.tool_calls = Some(std::mem::take(&mut self.tool_calls));
            }
            self.store.append(&self.key, message);
            self.committed = true;
        }
    }
}
