use crate::core::{ChatId, MessageId, RecordId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed reply event. Immutable once created; corrections are made by
/// deleting the record and appending a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub record_id: RecordId,
    pub target_user_id: UserId,
    #[serde(default)]
    pub target_username: Option<String>,
    pub chat_id: ChatId,
    pub original_message_id: MessageId,
    #[serde(default)]
    pub original_sender_id: Option<UserId>,
    pub original_timestamp: DateTime<Utc>,
    pub reply_timestamp: DateTime<Utc>,
    pub latency_seconds: f64,
    #[serde(default)]
    pub original_text: String,
    #[serde(default)]
    pub reply_text: String,
}

/// A message that a tracked user may reply to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeringMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub message_id: MessageId,
    /// Id of the message being replied to, if the transport reported one
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub text: String,
}

/// What the chat transport hands over when a user replies to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEvent {
    pub tracked_user_id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    pub chat_id: ChatId,
    /// The replied-to message when the transport delivers it inline;
    /// otherwise it is looked up in the pending cache.
    #[serde(default)]
    pub triggering: Option<TriggeringMessage>,
    pub reply: ReplyMessage,
    pub received_at: DateTime<Utc>,
}

/// Elapsed seconds between the two instants, clamped at zero so clock skew
/// between the transport and this process never yields a negative latency.
pub fn latency_between(original: DateTime<Utc>, reply: DateTime<Utc>) -> f64 {
    let millis = (reply - original).num_milliseconds();
    (millis.max(0) as f64) / 1000.0
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

impl ResponseRecord {
    pub(crate) fn build(
        record_id: RecordId,
        event: &ReplyEvent,
        triggering: &TriggeringMessage,
        max_chars: usize,
    ) -> Self {
        Self {
            record_id,
            target_user_id: event.tracked_user_id,
            target_username: event.username.clone(),
            chat_id: triggering.chat_id,
            original_message_id: triggering.message_id,
            original_sender_id: triggering.sender_id,
            original_timestamp: triggering.sent_at,
            reply_timestamp: event.received_at,
            latency_seconds: latency_between(triggering.sent_at, event.received_at),
            original_text: snippet(&triggering.text, max_chars),
            reply_text: snippet(&event.reply.text, max_chars),
        }
    }
}

/// Human-readable latency, e.g. `"42.0 seconds"` or `"1.5 hours"`.
pub fn format_latency(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1} seconds", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1} minutes", seconds / 60.0)
    } else {
        format!("{:.1} hours", seconds / 3600.0)
    }
}
