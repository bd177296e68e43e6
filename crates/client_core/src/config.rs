use std::time::Duration;

/// Tunables for the synchronization core. The defaults match the production
/// console: a 5s fallback poll per open conversation and a 15s authoritative
/// unread reconcile.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fallback poll interval for each open conversation.
    pub conversation_poll_interval: Duration,
    /// Interval between authoritative unread summary fetches.
    pub reconcile_interval: Duration,
    /// Messages requested per pagination page. Clamped to 1..=100 at the
    /// transport.
    pub page_size: u32,
    /// First reconnect delay after a push-channel drop; doubles per
    /// consecutive failure.
    pub reconnect_backoff_base: Duration,
    /// Upper bound on the reconnect delay, before jitter.
    pub reconnect_backoff_cap: Duration,
    /// Optional department scope forwarded to the unread summary endpoint.
    pub department: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversation_poll_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(15),
            page_size: 50,
            reconnect_backoff_base: Duration::from_millis(500),
            reconnect_backoff_cap: Duration::from_secs(30),
            department: None,
        }
    }
}
