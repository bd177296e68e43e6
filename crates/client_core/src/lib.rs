use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use shared::{
    domain::{Direction, WaId},
    protocol::{ServerEvent, UnreadDelta},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub mod config;
pub mod feed;
pub mod push;
pub mod reconciler;
pub mod transport;
pub mod unread;

pub use config::SyncConfig;
pub use feed::ConversationFeed;
pub use push::{PushChannel, PushChannelError, PushEvent, PushState};
pub use transport::{ChatTransport, RestTransport};
pub use unread::{UnreadListenerId, UnreadSnapshot, UnreadStore};

/// View-layer notification stream. Events carry no feed contents; observers
/// re-read the store or feed they care about.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    UnreadChanged(UnreadSnapshot),
    ConversationUpdated { wa_id: WaId },
    PushStateChanged(PushState),
    Error(String),
}

struct OpenConversation {
    feed: Arc<ConversationFeed>,
    poll_task: JoinHandle<()>,
}

struct ClientState {
    conversations: HashMap<WaId, OpenConversation>,
    reconciler: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

/// Session-scoped wiring of the sync core: REST transport, unread store,
/// push channel, periodic reconciler, and one feed plus fallback poll per
/// open conversation. Push listeners are global and route events to feeds
/// by the payload's `wa_id`; they end only with [`shutdown`].
///
/// [`shutdown`]: ConsoleClient::shutdown
pub struct ConsoleClient {
    transport: Arc<dyn ChatTransport>,
    unread: Arc<UnreadStore>,
    push: PushChannel,
    config: SyncConfig,
    visible: AtomicBool,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConsoleClient {
    pub async fn connect(server_url: &str, config: SyncConfig) -> Result<Arc<Self>> {
        Self::connect_with_transport(server_url, Arc::new(RestTransport::new(server_url)), config)
            .await
    }

    /// Same wiring with a caller-supplied REST transport; the push channel
    /// still connects to `{server_url}/ws`.
    pub async fn connect_with_transport(
        server_url: &str,
        transport: Arc<dyn ChatTransport>,
        config: SyncConfig,
    ) -> Result<Arc<Self>> {
        let push = PushChannel::connect(
            server_url,
            config.reconnect_backoff_base,
            config.reconnect_backoff_cap,
        )?;
        let (events, _) = broadcast::channel(1024);
        let unread = UnreadStore::new();

        {
            let events = events.clone();
            unread.subscribe(move |snapshot| {
                let _ = events.send(ClientEvent::UnreadChanged(snapshot));
            });
        }

        let reconciler = reconciler::spawn_reconciler(
            Arc::clone(&transport),
            Arc::clone(&unread),
            push.subscribe(),
            config.reconcile_interval,
            config.department.clone(),
        );

        let client = Arc::new(Self {
            transport,
            unread,
            push,
            config,
            visible: AtomicBool::new(true),
            inner: Mutex::new(ClientState {
                conversations: HashMap::new(),
                reconciler: Some(reconciler),
                dispatcher: None,
            }),
            events,
        });

        let dispatcher = client.spawn_dispatcher();
        client.inner.lock().await.dispatcher = Some(dispatcher);
        info!(server_url, "client: connected");
        Ok(client)
    }

    /// The process-wide unread store. Created at connect, lives for the
    /// session, no teardown.
    pub fn unread(&self) -> Arc<UnreadStore> {
        Arc::clone(&self.unread)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn push_state(&self) -> PushState {
        self.push.state()
    }

    /// Mirrors the embedding window's visibility. Hidden suspends every
    /// conversation poll; the unread reconciler keeps running.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }

    /// Opens a contact's conversation: initial page fetch, fallback poll,
    /// and a one-shot mark-read when the caller knows unread messages exist
    /// (per-contact counts live on the contact list, not in the store, so
    /// the caller supplies the number). Opening never fails; a failed
    /// initial load is retried by the poll. Reopening an already open
    /// contact returns the live feed without side effects.
    pub async fn open_conversation(
        self: &Arc<Self>,
        wa_id: WaId,
        known_unread: u64,
    ) -> Arc<ConversationFeed> {
        let feed = {
            let mut inner = self.inner.lock().await;
            if let Some(open) = inner.conversations.get(&wa_id) {
                return Arc::clone(&open.feed);
            }
            let feed = ConversationFeed::new(
                wa_id.clone(),
                self.config.page_size,
                Arc::clone(&self.transport),
            );
            let poll_task = self.spawn_feed_poll(&feed);
            inner.conversations.insert(
                wa_id.clone(),
                OpenConversation {
                    feed: Arc::clone(&feed),
                    poll_task,
                },
            );
            feed
        };
        info!(wa_id = %wa_id, known_unread, "client: conversation opened");

        match feed.load_older().await {
            Ok(_) => {
                let _ = self.events.send(ClientEvent::ConversationUpdated {
                    wa_id: wa_id.clone(),
                });
            }
            Err(err) => {
                // The poll retries on its next tick; the feed stays open.
                warn!(wa_id = %wa_id, error = %err, "client: initial page load failed");
            }
        }

        if known_unread > 0 {
            self.mark_conversation_read(&wa_id).await;
        }

        feed
    }

    /// Stops the contact's poll and releases its feed; push events for the
    /// contact are ignored until it is opened again. Feed state is rebuilt
    /// from scratch on reopen.
    pub async fn close_conversation(&self, wa_id: &WaId) {
        let removed = self.inner.lock().await.conversations.remove(wa_id);
        if let Some(open) = removed {
            open.poll_task.abort();
            info!(wa_id = %wa_id, "client: conversation closed");
        }
    }

    /// Tears down the session: push channel closed, reconciler, dispatcher
    /// and all conversation polls aborted. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.push.close();
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.reconciler.take() {
            task.abort();
        }
        if let Some(task) = inner.dispatcher.take() {
            task.abort();
        }
        for (_, open) in inner.conversations.drain() {
            open.poll_task.abort();
        }
        info!("client: shut down");
    }

    /// Optimistic aggregate correction: the server reports how many
    /// messages it actually flipped and only that count is folded into the
    /// store. On failure the badge stays as-is.
    async fn mark_conversation_read(&self, wa_id: &WaId) {
        match self.transport.mark_read(wa_id).await {
            Ok(response) => {
                debug!(
                    wa_id = %wa_id,
                    marked_read = response.marked_read,
                    "client: conversation marked read"
                );
                self.unread.decrement_unread(response.marked_read);
            }
            Err(err) => {
                warn!(wa_id = %wa_id, error = %err, "client: mark-read failed, badge unchanged");
            }
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut push_events = self.push.subscribe();
        tokio::spawn(async move {
            loop {
                match push_events.recv().await {
                    Ok(PushEvent::Event(event)) => client.dispatch_server_event(event).await,
                    Ok(PushEvent::Connected { resumed }) => {
                        debug!(resumed, "client: push channel open");
                        let _ = client
                            .events
                            .send(ClientEvent::PushStateChanged(PushState::Open));
                    }
                    Ok(PushEvent::Disconnected { reason }) => {
                        let _ = client
                            .events
                            .send(ClientEvent::PushStateChanged(PushState::Connecting));
                        let _ = client
                            .events
                            .send(ClientEvent::Error(format!("push channel dropped: {reason}")));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: push event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn dispatch_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage { wa_id, message } => {
                if message.direction == Direction::Inbound {
                    self.unread.apply_delta(&UnreadDelta {
                        contact_id: wa_id.clone(),
                        message_count_change: 1,
                    });
                }
                if let Some(feed) = self.feed_for(&wa_id).await {
                    if feed.ingest_live(&message) {
                        let _ = self
                            .events
                            .send(ClientEvent::ConversationUpdated { wa_id });
                    }
                }
            }
            ServerEvent::MessageStatusUpdate {
                wa_id,
                status,
                error,
            } => {
                if let Some(feed) = self.feed_for(&wa_id).await {
                    if feed.apply_status_update(status, error.as_deref()) {
                        let _ = self
                            .events
                            .send(ClientEvent::ConversationUpdated { wa_id });
                    }
                }
            }
            ServerEvent::UnreadDelta(delta) => {
                self.unread.apply_delta(&delta);
            }
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "client: server error event");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
            }
        }
    }

    async fn feed_for(&self, wa_id: &WaId) -> Option<Arc<ConversationFeed>> {
        self.inner
            .lock()
            .await
            .conversations
            .get(wa_id)
            .map(|open| Arc::clone(&open.feed))
    }

    fn spawn_feed_poll(self: &Arc<Self>, feed: &Arc<ConversationFeed>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let feed = Arc::clone(feed);
        tokio::spawn(async move {
            let mut ticker = interval(client.config.conversation_poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The zeroth tick fires immediately; the opening page load
            // already covers it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !client.visible.load(Ordering::Relaxed) {
                    continue;
                }
                match feed.refresh().await {
                    Ok(true) => {
                        let _ = client.events.send(ClientEvent::ConversationUpdated {
                            wa_id: feed.wa_id().clone(),
                        });
                    }
                    Ok(false) => {}
                    Err(err) => {
                        debug!(wa_id = %feed.wa_id(), error = %err, "client: conversation poll failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
