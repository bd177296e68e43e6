use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};

use shared::protocol::{UnreadDelta, UnreadSummary};
use tracing::debug;

/// Immutable unread aggregate as sampled by the view layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub total_unread_messages: u64,
    pub contacts_with_unread: u64,
}

/// Handle returned by [`UnreadStore::subscribe`]; pass it back to
/// [`UnreadStore::unsubscribe`] to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadListenerId(usize);

type UnreadListener = Arc<dyn Fn(UnreadSnapshot) + Send + Sync>;

struct WrappedListener {
    id: usize,
    listener: UnreadListener,
}

struct UnreadState {
    current: UnreadSnapshot,
    server: UnreadSnapshot,
    listeners: Vec<WrappedListener>,
}

/// Single source of truth for the unread badge, combining low-latency push
/// deltas with the periodic authoritative summary. Created once at client
/// bootstrap and shared for the whole session; reads are synchronous so a
/// rendering layer can sample it outside of any event (refocus, remount).
///
/// The store keeps no per-contact ledger: `contacts_with_unread` moves by
/// the sign of each delta, and `decrement_unread` adjusts the aggregate
/// only. Both can drift from the true per-contact picture when several
/// conversations change between reconcile ticks; `sync_from_server` bounds
/// that drift to one interval. Known trade-off, kept on purpose.
pub struct UnreadStore {
    state: Mutex<UnreadState>,
    next_listener_id: AtomicUsize,
}

impl UnreadStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(UnreadState {
                current: UnreadSnapshot::default(),
                server: UnreadSnapshot::default(),
                listeners: Vec::new(),
            }),
            next_listener_id: AtomicUsize::new(0),
        })
    }

    /// Current aggregate. O(1), never fails, never awaits.
    pub fn snapshot(&self) -> UnreadSnapshot {
        self.state.lock().unwrap().current
    }

    /// The last server-authoritative value, zeroed until the first
    /// `sync_from_server`, so reads before any hydration are deterministic.
    pub fn server_snapshot(&self) -> UnreadSnapshot {
        self.state.lock().unwrap().server
    }

    /// Registers a listener invoked once per value transition. Listeners
    /// run outside the store lock and may re-enter the store.
    pub fn subscribe(
        &self,
        listener: impl Fn(UnreadSnapshot) + Send + Sync + 'static,
    ) -> UnreadListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().listeners.push(WrappedListener {
            id,
            listener: Arc::new(listener),
        });
        UnreadListenerId(id)
    }

    /// Detaches a listener and releases it. Removing an already removed
    /// listener is a no-op.
    pub fn unsubscribe(&self, id: UnreadListenerId) {
        self.state
            .lock()
            .unwrap()
            .listeners
            .retain(|wrapped| wrapped.id != id.0);
    }

    /// Folds an incremental change into the aggregate. The message total
    /// moves by `message_count_change` and the contact count by its sign;
    /// both clamp at zero instead of failing.
    pub fn apply_delta(&self, delta: &UnreadDelta) {
        debug!(
            contact_id = %delta.contact_id,
            message_count_change = delta.message_count_change,
            "unread: delta applied"
        );
        self.fold(delta.message_count_change);
    }

    /// Optimistic correction for the mark-as-read path, used when only the
    /// aggregate count removed is known, not which contact held it.
    pub fn decrement_unread(&self, by_count: u64) {
        self.fold(-(by_count.min(i64::MAX as u64) as i64));
    }

    /// Replaces local state with the server's numbers. Deltas folded in
    /// before this call are superseded, never merged.
    pub fn sync_from_server(&self, summary: UnreadSummary) {
        let next = UnreadSnapshot {
            total_unread_messages: summary.total_unread_messages,
            contacts_with_unread: summary.contacts_with_unread,
        };
        let mut state = self.state.lock().unwrap();
        state.server = next;
        Self::commit(state, next);
    }

    fn fold(&self, message_count_change: i64) {
        if message_count_change == 0 {
            return;
        }
        let state = self.state.lock().unwrap();
        let next = UnreadSnapshot {
            total_unread_messages: add_clamped(
                state.current.total_unread_messages,
                message_count_change,
            ),
            contacts_with_unread: add_clamped(
                state.current.contacts_with_unread,
                message_count_change.signum(),
            ),
        };
        Self::commit(state, next);
    }

    /// Publishes `next` and notifies listeners, once per actual transition.
    /// The lock is released before any listener runs.
    fn commit(mut state: MutexGuard<'_, UnreadState>, next: UnreadSnapshot) {
        if state.current == next {
            return;
        }
        state.current = next;
        let listeners: Vec<UnreadListener> = state
            .listeners
            .iter()
            .map(|wrapped| Arc::clone(&wrapped.listener))
            .collect();
        drop(state);
        for listener in listeners {
            listener(next);
        }
    }
}

fn add_clamped(base: u64, change: i64) -> u64 {
    if change >= 0 {
        base.saturating_add(change as u64)
    } else {
        base.saturating_sub(change.unsigned_abs())
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
