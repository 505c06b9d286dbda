use super::record::TriggeringMessage;
use crate::core::{ChatId, MessageId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Messages still awaiting a reply, keyed by chat and message id.
///
/// Persisted as the `message_cache` dataset alongside the ledger. The dirty
/// flag tells the flush pipeline whether there is anything to write.
#[derive(Debug, Default)]
pub struct PendingCache {
    messages: HashMap<(ChatId, MessageId), TriggeringMessage>,
    dirty: bool,
}

impl PendingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<TriggeringMessage>) -> Self {
        Self {
            messages: messages
                .into_iter()
                .map(|message| ((message.chat_id, message.message_id), message))
                .collect(),
            dirty: false,
        }
    }

    pub fn remember(&mut self, message: TriggeringMessage) {
        self.messages
            .insert((message.chat_id, message.message_id), message);
        self.dirty = true;
    }

    /// Remove and return a message once its reply has been recorded
    pub fn resolve(&mut self, chat_id: ChatId, message_id: MessageId) -> Option<TriggeringMessage> {
        let resolved = self.messages.remove(&(chat_id, message_id));
        if resolved.is_some() {
            self.dirty = true;
        }
        resolved
    }

    pub fn get(&self, chat_id: ChatId, message_id: MessageId) -> Option<&TriggeringMessage> {
        self.messages.get(&(chat_id, message_id))
    }

    /// Drop messages sent before `cutoff`; returns how many were dropped
    pub fn expire_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.messages.len();
        self.messages.retain(|_, message| message.sent_at >= cutoff);
        let expired = before - self.messages.len();
        if expired > 0 {
            self.dirty = true;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Contents to persist if anything changed since the last call, in a
    /// stable order. Clears the dirty flag; call [`Self::mark_dirty`] if the
    /// write fails.
    pub fn take_dirty_snapshot(&mut self) -> Option<Vec<TriggeringMessage>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        let mut messages = self.messages.values().cloned().collect::<Vec<_>>();
        messages.sort_by(|a, b| {
            a.chat_id
                .cmp(&b.chat_id)
                .then(a.message_id.cmp(&b.message_id))
        });
        Some(messages)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}
