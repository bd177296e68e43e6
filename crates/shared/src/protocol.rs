use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{BroadcastId, Direction, MessageId, MessageStatus, WaId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub wa_id: WaId,
    pub direction: Direction,
    pub content: String,
    pub status: MessageStatus,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<BroadcastId>,
}

impl Message {
    /// The backend does not always emit well-formed timestamps, so the wire
    /// field stays a string and is parsed on demand. `None` means the
    /// message belongs in the trailing unknown-time bucket, not that it can
    /// be discarded.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.timestamp.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }
}

/// One backward pagination page for a conversation, bounded by a `before_id`
/// cursor on the request side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Authoritative unread aggregate computed server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub total_unread_messages: u64,
    pub contacts_with_unread: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub marked_read: u64,
}

/// Incremental unread change. Ephemeral; folded into the aggregate and
/// discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadDelta {
    pub contact_id: WaId,
    pub message_count_change: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        wa_id: WaId,
        message: Message,
    },
    MessageStatusUpdate {
        wa_id: WaId,
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    UnreadDelta(UnreadDelta),
    Error(ApiError),
}
