//! Webhook definitions, the management-plane lookup, and validation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FeedError;

/// A registered webhook. Owned by the management plane; the delivery
/// pipeline only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    /// Target endpoint (`http` or `https`).
    pub url: String,
    /// Chain slug whose blocks this webhook receives (e.g. `"ethereum"`).
    pub chain_id: String,
    /// Redeliveries tolerated for one range before it is skipped.
    pub max_retries: u32,
    /// Upper bound on blocks per request body.
    pub max_blocks: u32,
    /// Per-request client timeout.
    pub timeout_ms: u64,
}

/// Looks webhook definitions up by id at delivery time.
///
/// `Ok(None)` means the webhook was deleted; the caller drops the job.
#[async_trait]
pub trait WebhookDirectory: Send + Sync {
    async fn find_webhook(&self, id: &str) -> Result<Option<Webhook>, FeedError>;
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Bounds applied to webhook definitions before they enter a shard.
///
/// Construct once at startup and pass it to whatever registers webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookValidator {
    pub max_blocks: (u32, u32),
    pub max_retries: (u32, u32),
    pub timeout_ms: (u64, u64),
    /// Longest accepted id or chain slug.
    pub max_id_len: usize,
}

impl Default for WebhookValidator {
    fn default() -> Self {
        Self {
            max_blocks: (1, 10),
            max_retries: (0, 10),
            timeout_ms: (1_000, 10_000),
            max_id_len: 255,
        }
    }
}

impl WebhookValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first rule `webhook` breaks.
    pub fn validate(&self, webhook: &Webhook) -> Result<(), FeedError> {
        self.check_ident("id", &webhook.id)?;
        self.check_ident("chain_id", &webhook.chain_id)?;

        let url = Url::parse(&webhook.url)
            .map_err(|e| FeedError::validation("url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FeedError::validation(
                "url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        check_range("max_blocks", webhook.max_blocks, self.max_blocks)?;
        check_range("max_retries", webhook.max_retries, self.max_retries)?;
        check_range("timeout_ms", webhook.timeout_ms, self.timeout_ms)?;
        Ok(())
    }

    fn check_ident(&self, field: &str, value: &str) -> Result<(), FeedError> {
        if value.trim().is_empty() {
            return Err(FeedError::validation(field, "must not be empty"));
        }
        if value.len() > self.max_id_len {
            return Err(FeedError::validation(
                field,
                format!("longer than {} bytes", self.max_id_len),
            ));
        }
        Ok(())
    }
}

fn check_range<T>(field: &str, value: T, (min, max): (T, T)) -> Result<(), FeedError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(FeedError::validation(
            field,
            format!("{value} is outside [{min}, {max}]"),
        ));
    }
    Ok(())
}

// ─── In-memory directory (for testing) ───────────────────────────────────────

/// In-memory webhook directory. Data is lost on drop.
#[derive(Default)]
pub struct MemoryWebhookDirectory {
    inner: Mutex<HashMap<String, Webhook>>,
}

impl MemoryWebhookDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, webhook: Webhook) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(webhook.id.clone(), webhook);
        }
    }

    pub fn remove(&self, id: &str) -> Option<Webhook> {
        self.inner.lock().ok().and_then(|mut map| map.remove(id))
    }
}

#[async_trait]
impl WebhookDirectory for MemoryWebhookDirectory {
    async fn find_webhook(&self, id: &str) -> Result<Option<Webhook>, FeedError> {
        let map = self
            .inner
            .lock()
            .map_err(|e| FeedError::Other(e.to_string()))?;
        Ok(map.get(id).cloned())
    }
}
