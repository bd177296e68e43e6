use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use rand::Rng;
use shared::protocol::ServerEvent;
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum PushChannelError {
    #[error("invalid server url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("server url must be http(s), got {scheme}://")]
    UnsupportedScheme { scheme: String },
}

/// Connection lifecycle as observed by consumers. `Closed` is reached only
/// through explicit teardown; every other drop reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PushEvent {
    /// The socket opened. `resumed` is false only for the first open of the
    /// channel's lifetime; any later open means events may have been lost
    /// while disconnected and an out-of-band resync is required.
    Connected { resumed: bool },
    /// The socket dropped; a reconnect attempt is already scheduled.
    Disconnected { reason: String },
    Event(ServerEvent),
}

/// Persistent push connection with automatic reconnect, so the unread store
/// and conversation feeds never deal with transport state.
pub struct PushChannel {
    events: broadcast::Sender<PushEvent>,
    state_tx: Arc<watch::Sender<PushState>>,
    state_rx: watch::Receiver<PushState>,
    task: JoinHandle<()>,
}

impl PushChannel {
    /// Starts the channel against `{server_url}/ws`, with the http scheme
    /// rewritten to ws. The connection task runs until [`close`].
    ///
    /// [`close`]: PushChannel::close
    pub fn connect(
        server_url: &str,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Result<Self, PushChannelError> {
        let ws_url = derive_ws_url(server_url)?;
        let (events, _) = broadcast::channel(1024);
        let (state_tx, state_rx) = watch::channel(PushState::Connecting);
        let state_tx = Arc::new(state_tx);
        let task = tokio::spawn(run(
            ws_url,
            events.clone(),
            Arc::clone(&state_tx),
            backoff_base,
            backoff_cap,
        ));
        Ok(Self {
            events,
            state_tx,
            state_rx,
            task,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PushState {
        *self.state_rx.borrow()
    }

    /// Watch cell for observers that want to await state changes.
    pub fn watch_state(&self) -> watch::Receiver<PushState> {
        self.state_rx.clone()
    }

    /// Deterministic teardown: the connection task is cancelled, which
    /// releases the socket and any pending reconnect timer; the channel
    /// never reconnects afterwards. Safe to call more than once.
    pub fn close(&self) {
        self.task.abort();
        let _ = self.state_tx.send(PushState::Closed);
        info!("push: channel closed");
    }
}

async fn run(
    ws_url: String,
    events: broadcast::Sender<PushEvent>,
    state_tx: Arc<watch::Sender<PushState>>,
    backoff_base: Duration,
    backoff_cap: Duration,
) {
    let mut consecutive_failures: u32 = 0;
    let mut had_session = false;
    loop {
        let _ = state_tx.send(PushState::Connecting);
        match connect_async(&ws_url).await {
            Ok((ws_stream, _)) => {
                consecutive_failures = 0;
                let resumed = had_session;
                had_session = true;
                let _ = state_tx.send(PushState::Open);
                info!(resumed, "push: channel open");
                let _ = events.send(PushEvent::Connected { resumed });

                let (_, mut ws_reader) = ws_stream.split();
                let reason = loop {
                    match ws_reader.next().await {
                        Some(Ok(Message::Text(text))) => dispatch_frame(&events, &text),
                        Some(Ok(Message::Close(_))) => {
                            break "server closed the connection".to_string()
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break format!("websocket receive failed: {err}"),
                        None => break "websocket stream ended".to_string(),
                    }
                };
                warn!(reason = %reason, "push: channel dropped");
                let _ = events.send(PushEvent::Disconnected { reason });
            }
            Err(err) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                warn!(consecutive_failures, error = %err, "push: connect failed");
            }
        }

        let delay = reconnect_delay(backoff_base, backoff_cap, consecutive_failures);
        sleep(delay).await;
    }
}

fn dispatch_frame(events: &broadcast::Sender<PushEvent>, text: &str) {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => {
            let _ = events.send(PushEvent::Event(event));
        }
        Err(err) => {
            warn!(error = %err, "push: dropping undecodable frame");
        }
    }
}

/// Exponential backoff with uniform jitter: the base doubles per
/// consecutive failure, bounded by `cap`, plus up to 50% random spread.
fn reconnect_delay(base: Duration, cap: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.min(16);
    let delay = base.saturating_mul(1u32 << exponent).min(cap);
    let spread_ms = delay.as_millis() as u64 / 2;
    if spread_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread_ms))
}

fn derive_ws_url(server_url: &str) -> Result<String, PushChannelError> {
    let parsed = Url::parse(server_url).map_err(|source| PushChannelError::InvalidUrl {
        url: server_url.to_string(),
        source,
    })?;
    let ws_base = match parsed.scheme() {
        "https" => server_url.replacen("https://", "wss://", 1),
        "http" => server_url.replacen("http://", "ws://", 1),
        other => {
            return Err(PushChannelError::UnsupportedScheme {
                scheme: other.to_string(),
            })
        }
    };
    Ok(format!("{}/ws", ws_base.trim_end_matches('/')))
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
