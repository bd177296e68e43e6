use super::*;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{MessageId, WaId},
    protocol::{ConversationPage, MarkReadResponse, UnreadSummary},
};
use tokio::{
    sync::Mutex as AsyncMutex,
    time::{sleep, timeout},
};

fn summary(total: u64, contacts: u64) -> UnreadSummary {
    UnreadSummary {
        total_unread_messages: total,
        contacts_with_unread: contacts,
    }
}

struct SummaryScript {
    responses: AsyncMutex<VecDeque<Result<UnreadSummary>>>,
    departments: AsyncMutex<Vec<Option<String>>>,
    calls: AtomicUsize,
}

impl SummaryScript {
    fn new(responses: Vec<Result<UnreadSummary>>) -> Arc<Self> {
        Arc::new(Self {
            responses: AsyncMutex::new(responses.into_iter().collect()),
            departments: AsyncMutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ChatTransport for SummaryScript {
    async fn fetch_page(
        &self,
        _wa_id: &WaId,
        _limit: u32,
        _before_id: Option<MessageId>,
    ) -> Result<ConversationPage> {
        Err(anyhow!("not part of this test"))
    }

    async fn fetch_unread_summary(&self, department: Option<&str>) -> Result<UnreadSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.departments
            .lock()
            .await
            .push(department.map(str::to_string));
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("summary script exhausted")))
    }

    async fn mark_read(&self, _wa_id: &WaId) -> Result<MarkReadResponse> {
        Err(anyhow!("not part of this test"))
    }
}

async fn wait_for_total(store: &UnreadStore, expected: u64) {
    timeout(Duration::from_secs(2), async {
        while store.snapshot().total_unread_messages != expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("store never reached the expected total");
}

#[tokio::test]
async fn the_first_sync_runs_immediately() {
    let transport = SummaryScript::new(vec![Ok(summary(4, 2))]);
    let store = UnreadStore::new();
    let (_push_tx, push_rx) = broadcast::channel(16);

    let handle = spawn_reconciler(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        Arc::clone(&store),
        push_rx,
        Duration::from_secs(60),
        Some("support".to_string()),
    );

    wait_for_total(&store, 4).await;
    assert_eq!(store.snapshot().contacts_with_unread, 2);
    assert_eq!(store.server_snapshot().total_unread_messages, 4);
    assert_eq!(
        transport.departments.lock().await.clone(),
        vec![Some("support".to_string())]
    );
    handle.abort();
}

#[tokio::test]
async fn a_resumed_push_session_triggers_an_out_of_band_sync() {
    let transport = SummaryScript::new(vec![Ok(summary(1, 1)), Ok(summary(6, 3))]);
    let store = UnreadStore::new();
    let (push_tx, push_rx) = broadcast::channel(16);

    let handle = spawn_reconciler(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        Arc::clone(&store),
        push_rx,
        Duration::from_secs(60),
        None,
    );
    wait_for_total(&store, 1).await;

    // The first open of a session carries no gap to cover.
    push_tx
        .send(PushEvent::Connected { resumed: false })
        .expect("send");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

    push_tx
        .send(PushEvent::Connected { resumed: true })
        .expect("send");
    wait_for_total(&store, 6).await;
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    handle.abort();
}

#[tokio::test]
async fn fetch_failures_are_absorbed_until_the_next_tick() {
    let transport = SummaryScript::new(vec![Err(anyhow!("boom")), Ok(summary(2, 1))]);
    let store = UnreadStore::new();
    let (_push_tx, push_rx) = broadcast::channel(16);

    let handle = spawn_reconciler(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        Arc::clone(&store),
        push_rx,
        Duration::from_millis(25),
        None,
    );

    wait_for_total(&store, 2).await;
    assert!(transport.calls.load(Ordering::SeqCst) >= 2);
    handle.abort();
}

#[tokio::test]
async fn polling_outlives_the_push_event_stream() {
    let transport = SummaryScript::new(vec![Ok(summary(1, 1)), Ok(summary(5, 2))]);
    let store = UnreadStore::new();
    let totals: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
    {
        let sink = Arc::clone(&totals);
        store.subscribe(move |snapshot| {
            sink.lock().unwrap().push(snapshot.total_unread_messages)
        });
    }
    let (push_tx, push_rx) = broadcast::channel(16);

    let handle = spawn_reconciler(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        Arc::clone(&store),
        push_rx,
        Duration::from_millis(25),
        None,
    );
    drop(push_tx);

    timeout(Duration::from_secs(2), async {
        while totals.lock().unwrap().len() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reconciler stopped syncing after the push stream closed");
    assert_eq!(totals.lock().unwrap().clone(), vec![1, 5]);
    handle.abort();
}
