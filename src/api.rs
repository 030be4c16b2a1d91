use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    classify::decode_notifications,
    consts::{API_ERROR_BODY_MAX_CHARS, API_REQUEST_TIMEOUT_SECS},
    error::{Error, Result},
    model::{Notification, NotificationListWire, UnreadCountWire},
    settings::normalize_base_url,
    util::truncate_message,
};

/// One page of the notifications listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPage {
    pub count: Option<u64>,
    pub has_next: bool,
    pub results: Vec<Notification>,
}

/// Client for the REST notification endpoints, the durable source of truth
/// behind the socket channel.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            token: token.into().trim().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.bearer_auth(&self.token).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read response body>".to_string());
        Err(Error::Http {
            status,
            body: truncate_message(&body, API_ERROR_BODY_MAX_CHARS),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let endpoint = self.endpoint(path);
        debug!("GET {endpoint}");
        let response = self.execute(self.http.get(&endpoint)).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        let endpoint = self.endpoint(path);
        debug!("POST {endpoint}");
        self.execute(self.http.post(&endpoint)).await?;
        Ok(())
    }

    pub async fn list_notifications(&self, page: u32) -> Result<NotificationPage> {
        let wire: NotificationListWire =
            self.get_json(&format!("notifications/?page={}", page.max(1))).await?;
        Ok(match wire {
            NotificationListWire::Page(page) => NotificationPage {
                count: page.count,
                has_next: page.next.is_some_and(|next| !next.trim().is_empty()),
                results: decode_notifications(&page.results),
            },
            NotificationListWire::Plain(items) => NotificationPage {
                count: Some(items.len() as u64),
                has_next: false,
                results: decode_notifications(&items),
            },
        })
    }

    /// Walks pages until the server reports no next page or `max_pages` is hit.
    pub async fn fetch_all(&self, max_pages: u32) -> Result<Vec<Notification>> {
        let mut fresh = Vec::new();
        for page in 1..=max_pages.max(1) {
            let current = self.list_notifications(page).await?;
            let exhausted = !current.has_next || current.results.is_empty();
            fresh.extend(current.results);
            if exhausted {
                break;
            }
        }
        Ok(fresh)
    }

    pub async fn fetch_notification(&self, id: i64) -> Result<Notification> {
        self.get_json(&format!("notifications/{id}/")).await
    }

    /// Partial update; returns the server's view of the notification.
    pub async fn patch_notification<T: Serialize + ?Sized>(
        &self,
        id: i64,
        fields: &T,
    ) -> Result<Notification> {
        let endpoint = self.endpoint(&format!("notifications/{id}/"));
        debug!("PATCH {endpoint}");
        let response = self.execute(self.http.patch(&endpoint).json(fields)).await?;
        let value: Value = response.json().await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn mark_read(&self, id: i64) -> Result<()> {
        self.post_empty(&format!("notifications/{id}/mark_as_read/")).await
    }

    pub async fn mark_all_read(&self) -> Result<()> {
        self.post_empty("notifications/mark_all_as_read/").await
    }

    pub async fn unread_count(&self) -> Result<u64> {
        let wire: UnreadCountWire = self.get_json("notifications/unread_count/").await?;
        Ok(wire.unread_count)
    }
}
