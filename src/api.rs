//! HTTP transport for the order feed and per-order capability URLs.
//!
//! Polls go to `GET <feed>?after_id=<cursor>`; approve / update-eta POST a
//! single `eta` field; advance, complete and reject are plain GET triggers.
//! Relative capability references are resolved against the feed URL.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::dispatcher::{ActionTransport, TransportError};
use crate::poller::{parse_batch, Batch, OrderFeed, PollError};

const CAPABILITY_URL_MAX_LEN: usize = 2048;

// ---------------------------------------------------------------------------
// URL handling
// ---------------------------------------------------------------------------

/// Normalise the feed URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_feed_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Check a capability URL before it is opened outside the desk.
pub fn validate_capability_url(raw: &str) -> Result<Url, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("Capability URL cannot be empty".into());
    }
    if trimmed.len() > CAPABILITY_URL_MAX_LEN {
        return Err("Capability URL is too long".into());
    }

    let parsed = Url::parse(trimmed).map_err(|e| format!("Invalid capability URL: {e}"))?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "https" && scheme != "http" {
        return Err("Only http/https capability URLs are allowed".into());
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err("Credentialed URLs are not allowed".into());
    }
    if parsed.host_str().is_none() {
        return Err("Capability URL is missing a host".into());
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 | 403 => "Link is no longer authorized".to_string(),
        404 => "Order endpoint not found".to_string(),
        409 => "Order was already updated elsewhere".to_string(),
        410 => "Action link has already been used".to_string(),
        s if s >= 500 => format!("Order server error (HTTP {s})"),
        s => format!("Unexpected response from order server (HTTP {s})"),
    }
}

/// Prefer the server's own `error` / `message` field when it sends one.
fn status_detail(status: StatusCode, body_text: &str) -> String {
    serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| status_error(status))
}

fn poll_error(url: &str, err: reqwest::Error) -> PollError {
    if err.is_timeout() {
        PollError::Timeout
    } else if err.is_connect() {
        PollError::Connect(friendly_error(url, &err))
    } else if err.is_decode() || err.is_body() {
        PollError::Decode(err.to_string())
    } else {
        PollError::Transport(friendly_error(url, &err))
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(friendly_error(url, &err))
    } else {
        TransportError::Request(friendly_error(url, &err))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    feed_url: String,
    poll_client: Client,
    action_client: Client,
}

impl HttpTransport {
    pub fn new(
        feed_url: &str,
        poll_timeout: Duration,
        action_timeout: Duration,
    ) -> Result<Self, String> {
        let user_agent = format!("order-desk/{}", env!("CARGO_PKG_VERSION"));
        let poll_client = Client::builder()
            .timeout(poll_timeout)
            .user_agent(user_agent.clone())
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        let action_client = Client::builder()
            .timeout(action_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            feed_url: normalize_feed_url(feed_url),
            poll_client,
            action_client,
        })
    }

    async fn expect_success(url: &str, resp: reqwest::Response) -> Result<(), TransportError> {
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            return Ok(());
        }
        let body_text = resp.text().await.unwrap_or_default();
        let err = TransportError::Status {
            status: status.as_u16(),
            message: status_detail(status, &body_text),
        };
        debug!(url, error = %err, "Action call refused");
        Err(err)
    }
}

#[async_trait]
impl OrderFeed for HttpTransport {
    async fn poll(&self, cursor: u64) -> Result<Batch, PollError> {
        let resp = self
            .poll_client
            .get(&self.feed_url)
            .query(&[("after_id", cursor)])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| poll_error(&self.feed_url, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(PollError::Status {
                status: status.as_u16(),
                message: status_detail(status, &body_text),
            });
        }

        let body_text = resp
            .text()
            .await
            .map_err(|e| poll_error(&self.feed_url, e))?;
        parse_batch(&body_text)
    }
}

#[async_trait]
impl ActionTransport for HttpTransport {
    async fn submit_eta(&self, url: &str, eta: u32) -> Result<(), TransportError> {
        let resp = self
            .action_client
            .post(url)
            .json(&serde_json::json!({ "eta": eta }))
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;
        Self::expect_success(url, resp).await?;
        info!(eta, "ETA submitted");
        Ok(())
    }

    async fn trigger(&self, url: &str) -> Result<(), TransportError> {
        let resp = self
            .action_client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;
        Self::expect_success(url, resp).await
    }

    fn resolve(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return trimmed.to_string();
        }
        Url::parse(&self.feed_url)
            .and_then(|base| base.join(trimmed))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| trimmed.to_string())
    }
}
