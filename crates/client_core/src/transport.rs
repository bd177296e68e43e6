use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{MessageId, WaId},
    protocol::{ConversationPage, MarkReadResponse, UnreadSummary},
};

/// REST surface consumed by the sync core, kept behind a trait so feeds and
/// the reconciler can be exercised against scripted responses.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// One backward pagination page for `wa_id`. `before_id` is omitted for
    /// the first/most-recent page.
    async fn fetch_page(
        &self,
        wa_id: &WaId,
        limit: u32,
        before_id: Option<MessageId>,
    ) -> Result<ConversationPage>;

    /// Authoritative unread aggregate, optionally scoped to a department.
    async fn fetch_unread_summary(&self, department: Option<&str>) -> Result<UnreadSummary>;

    /// Marks every unread message of `wa_id` read; the response carries how
    /// many the server actually flipped.
    async fn mark_read(&self, wa_id: &WaId) -> Result<MarkReadResponse>;
}

#[derive(Serialize)]
struct PageQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before_id: Option<i64>,
}

#[derive(Serialize)]
struct SummaryQuery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    department: Option<&'a str>,
}

pub struct RestTransport {
    http: Client,
    server_url: String,
}

impl RestTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatTransport for RestTransport {
    async fn fetch_page(
        &self,
        wa_id: &WaId,
        limit: u32,
        before_id: Option<MessageId>,
    ) -> Result<ConversationPage> {
        let limit = limit.clamp(1, 100);
        let page: ConversationPage = self
            .http
            .get(format!("{}/chat/{}", self.server_url, wa_id.0))
            .query(&PageQuery {
                limit,
                before_id: before_id.map(|id| id.0),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid conversation page payload for {}", wa_id.0))?;
        Ok(page)
    }

    async fn fetch_unread_summary(&self, department: Option<&str>) -> Result<UnreadSummary> {
        let summary: UnreadSummary = self
            .http
            .get(format!("{}/chat/unread-summary", self.server_url))
            .query(&SummaryQuery { department })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid unread summary payload")?;
        Ok(summary)
    }

    async fn mark_read(&self, wa_id: &WaId) -> Result<MarkReadResponse> {
        let response: MarkReadResponse = self
            .http
            .post(format!("{}/chat/{}/mark-read", self.server_url, wa_id.0))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid mark-read payload for {}", wa_id.0))?;
        Ok(response)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
