use std::{sync::Arc, time::Duration};

use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{push::PushEvent, transport::ChatTransport, unread::UnreadStore};

/// Spawns the periodic unread reconciler: an authoritative summary fetch on
/// every tick, regardless of push-channel health, plus an immediate one-shot
/// sync whenever the push channel reopens after a drop (events delivered
/// while disconnected are unrecoverable from the channel itself).
///
/// The first sync runs right away, so a freshly connected client converges
/// without waiting a full interval.
pub fn spawn_reconciler(
    transport: Arc<dyn ChatTransport>,
    store: Arc<UnreadStore>,
    mut push_events: broadcast::Receiver<PushEvent>,
    tick: Duration,
    department: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sync_once(transport.as_ref(), &store, department.as_deref()).await;
                }
                received = push_events.recv() => match received {
                    Ok(PushEvent::Connected { resumed: true }) => {
                        debug!("reconcile: push channel reopened, syncing now");
                        sync_once(transport.as_ref(), &store, department.as_deref()).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "reconcile: push event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("reconcile: push event stream closed, polling only");
                        loop {
                            ticker.tick().await;
                            sync_once(transport.as_ref(), &store, department.as_deref()).await;
                        }
                    }
                },
            }
        }
    })
}

/// One reconcile pass. Failures are logged and absorbed; the next tick
/// retries without backoff.
async fn sync_once(transport: &dyn ChatTransport, store: &UnreadStore, department: Option<&str>) {
    match transport.fetch_unread_summary(department).await {
        Ok(summary) => {
            debug!(
                total_unread_messages = summary.total_unread_messages,
                contacts_with_unread = summary.contacts_with_unread,
                "reconcile: summary applied"
            );
            store.sync_from_server(summary);
        }
        Err(err) => {
            warn!(error = %err, "reconcile: summary fetch failed");
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
