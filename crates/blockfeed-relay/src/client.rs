//! Outbound webhook calls.

use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use blockfeed_core::error::FeedError;
use blockfeed_core::types::Block;
use blockfeed_core::webhook::Webhook;

/// Settings shared by every delivery made from one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
}

fn default_user_agent() -> String {
    concat!("blockfeed/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_max_redirects() -> u32 {
    3
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
        }
    }
}

/// POSTs block batches to webhook endpoints.
///
/// The body is a JSON array of block payload strings, oldest first. Only a
/// 2xx status counts as delivered; anything else, including a timeout after
/// the webhook's `timeout_ms`, is an [`FeedError::Http`].
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new(opts: &DeliveryOptions) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .user_agent(&opts.user_agent)
            .redirect(reqwest::redirect::Policy::limited(opts.max_redirects as usize))
            .build()
            .map_err(|e| FeedError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    pub fn with_defaults() -> Result<Self, FeedError> {
        Self::new(&DeliveryOptions::default())
    }

    /// Deliver `blocks` to `webhook` in one request. Returns the status code.
    pub async fn deliver(&self, webhook: &Webhook, blocks: &[Block]) -> Result<u16, FeedError> {
        let payloads: Vec<&str> = blocks.iter().map(|b| b.payload.as_str()).collect();
        let body = serde_json::to_vec(&payloads)?;
        let span = info_span!(
            "webhook_delivery",
            webhook_id = %webhook.id,
            first_height = blocks.first().map(|b| b.height),
            last_height = blocks.last().map(|b| b.height),
        );

        async move {
            let started = Instant::now();
            let resp = self
                .http
                .post(&webhook.url)
                .timeout(Duration::from_millis(webhook.timeout_ms))
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        FeedError::Http(format!("timed out after {}ms", webhook.timeout_ms))
                    } else {
                        FeedError::Http(e.to_string())
                    }
                })?;

            let status = resp.status();
            let elapsed_ms = started.elapsed().as_millis() as u64;
            if !status.is_success() {
                warn!(status = status.as_u16(), elapsed_ms, "webhook rejected delivery");
                return Err(FeedError::Http(format!("{} responded {status}", webhook.url)));
            }
            debug!(status = status.as_u16(), elapsed_ms, blocks = blocks.len(), "webhook delivered");
            Ok(status.as_u16())
        }
        .instrument(span)
        .await
    }
}
