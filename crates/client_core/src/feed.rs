use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::{
    domain::{Direction, MessageId, MessageStatus, WaId},
    protocol::{ConversationPage, Message},
};
use tracing::{debug, warn};

use crate::transport::ChatTransport;

/// Ordered, deduplicated message sequence for one open conversation.
/// Backward pagination pages, the fallback poll, and live push delivery all
/// funnel through the same merge, so conflict resolution never depends on
/// which source produced a message.
pub struct ConversationFeed {
    wa_id: WaId,
    page_size: u32,
    transport: Arc<dyn ChatTransport>,
    state: Mutex<FeedState>,
}

struct FeedState {
    /// Sorted by `sort_key`: parseable timestamps ascending, then the
    /// unknown-time bucket, ties broken by id.
    messages: Vec<Message>,
    has_more: bool,
    oldest_loaded: Option<MessageId>,
    load_in_flight: bool,
}

impl ConversationFeed {
    pub fn new(wa_id: WaId, page_size: u32, transport: Arc<dyn ChatTransport>) -> Arc<Self> {
        Arc::new(Self {
            wa_id,
            page_size,
            transport,
            state: Mutex::new(FeedState {
                messages: Vec::new(),
                has_more: true,
                oldest_loaded: None,
                load_in_flight: false,
            }),
        })
    }

    pub fn wa_id(&self) -> &WaId {
        &self.wa_id
    }

    /// Snapshot of the merged sequence, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn has_more(&self) -> bool {
        self.state.lock().unwrap().has_more
    }

    /// Merges a backward pagination page and advances the pagination state
    /// (`has_more`, oldest-loaded cursor). Returns whether anything changed.
    pub fn ingest_page(&self, page: &ConversationPage) -> bool {
        let mut state = self.state.lock().unwrap();
        ingest_page_locked(&mut state, page)
    }

    /// Merges one message arriving out of band (push or poll refetch). An
    /// existing entry is updated in place, a new id is inserted in sorted
    /// position. Pagination state is untouched.
    pub fn ingest_live(&self, message: &Message) -> bool {
        if message.wa_id != self.wa_id {
            warn!(
                feed = %self.wa_id,
                message_wa_id = %message.wa_id,
                message_id = %message.id,
                "feed: dropping message routed to the wrong conversation"
            );
            return false;
        }
        let mut state = self.state.lock().unwrap();
        merge_one(&mut state, message)
    }

    /// Applies a conversation-scoped status receipt. Receipts carry no
    /// message id: delivery/read receipts are monotone over the whole
    /// conversation, so every outbound message below `status` is raised.
    /// `failed` instead marks only the newest outbound message still
    /// pending.
    pub fn apply_status_update(&self, status: MessageStatus, error: Option<&str>) -> bool {
        let mut state = self.state.lock().unwrap();
        if status == MessageStatus::Failed {
            let Some(message) = state
                .messages
                .iter_mut()
                .rev()
                .find(|m| m.direction == Direction::Outbound && m.status == MessageStatus::Pending)
            else {
                return false;
            };
            message.status = MessageStatus::Failed;
            warn!(
                wa_id = %self.wa_id,
                message_id = %message.id,
                error = error.unwrap_or("unspecified"),
                "feed: outbound message failed"
            );
            return true;
        }

        let target = status_rank(status);
        let mut changed = false;
        for message in state
            .messages
            .iter_mut()
            .filter(|m| m.direction == Direction::Outbound)
        {
            if status_rank(message.status) < target {
                message.status = status;
                changed = true;
            }
        }
        changed
    }

    /// Fetches the next backward page using the oldest loaded id as the
    /// cursor. Returns `Ok(false)` without touching the network when there
    /// is nothing older or a load is already in flight; the second caller
    /// is not queued. A failed fetch leaves feed state untouched.
    pub async fn load_older(&self) -> Result<bool> {
        let cursor = {
            let mut state = self.state.lock().unwrap();
            if !state.has_more || state.load_in_flight {
                return Ok(false);
            }
            state.load_in_flight = true;
            state.oldest_loaded
        };

        let fetched = self
            .transport
            .fetch_page(&self.wa_id, self.page_size, cursor)
            .await;

        let mut state = self.state.lock().unwrap();
        state.load_in_flight = false;
        match fetched {
            Ok(page) => {
                ingest_page_locked(&mut state, &page);
                debug!(
                    wa_id = %self.wa_id,
                    fetched = page.messages.len(),
                    has_more = page.has_more,
                    "feed: page merged"
                );
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Poll fallback body: fetches the most recent page and funnels every
    /// message through the live merge. Only backward pages move the cursor,
    /// so a head refetch cannot corrupt pagination.
    pub async fn refresh(&self) -> Result<bool> {
        let page = self
            .transport
            .fetch_page(&self.wa_id, self.page_size, None)
            .await?;
        let mut state = self.state.lock().unwrap();
        let mut changed = false;
        for message in &page.messages {
            changed |= merge_one(&mut state, message);
        }
        Ok(changed)
    }
}

fn ingest_page_locked(state: &mut FeedState, page: &ConversationPage) -> bool {
    let mut changed = false;
    for message in &page.messages {
        changed |= merge_one(state, message);
    }
    state.has_more = page.has_more;
    let page_oldest = page.messages.iter().map(|m| m.id).min();
    state.oldest_loaded = match (state.oldest_loaded, page_oldest) {
        (Some(current), Some(new)) => Some(current.min(new)),
        (None, new) => new,
        (current, None) => current,
    };
    changed
}

fn merge_one(state: &mut FeedState, incoming: &Message) -> bool {
    match state.messages.iter().position(|m| m.id == incoming.id) {
        Some(idx) => {
            let (changed, reposition) = absorb(&mut state.messages[idx], incoming);
            if reposition {
                let moved = state.messages.remove(idx);
                insert_sorted(&mut state.messages, moved);
            }
            changed
        }
        None => {
            insert_sorted(&mut state.messages, incoming.clone());
            true
        }
    }
}

/// The one conflict-resolution rule for duplicate ids: timestamps only move
/// forward, statuses only move up in rank, sentiment adopts any incoming
/// value. Returns (changed, needs reposition).
fn absorb(existing: &mut Message, incoming: &Message) -> (bool, bool) {
    let mut changed = false;
    let mut reposition = false;

    if let Some(incoming_ts) = incoming.timestamp_utc() {
        let newer = match existing.timestamp_utc() {
            Some(existing_ts) => incoming_ts > existing_ts,
            None => true,
        };
        if newer {
            existing.timestamp = incoming.timestamp.clone();
            changed = true;
            reposition = true;
        }
    }
    if status_rank(incoming.status) > status_rank(existing.status) {
        existing.status = incoming.status;
        changed = true;
    }
    if incoming.sentiment.is_some() && incoming.sentiment != existing.sentiment {
        existing.sentiment = incoming.sentiment.clone();
        changed = true;
    }
    (changed, reposition)
}

fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let key = sort_key(&message);
    let pos = messages
        .binary_search_by(|probe| sort_key(probe).cmp(&key))
        .unwrap_or_else(|pos| pos);
    messages.insert(pos, message);
}

/// Unparseable timestamps group after every parseable one instead of being
/// dropped; within either group ties break by id.
fn sort_key(message: &Message) -> (bool, DateTime<Utc>, MessageId) {
    match message.timestamp_utc() {
        Some(ts) => (false, ts, message.id),
        None => (true, DateTime::<Utc>::MIN_UTC, message.id),
    }
}

fn status_rank(status: MessageStatus) -> u8 {
    match status {
        MessageStatus::Pending => 0,
        MessageStatus::Sent => 1,
        MessageStatus::Delivered => 2,
        MessageStatus::Read => 3,
        MessageStatus::Failed => 4,
    }
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
