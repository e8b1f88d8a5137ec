//! Typed configuration shared by every process role.
//!
//! All structs deserialize from JSON with defaults for omitted fields; the
//! CLI fills them from flags and `BLOCKFEED_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::retry::RetryConfig;

/// How a consumer reads from an append-log topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Messages handed to the handler per call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Independent consumer tasks (`{name}-{i}`) run by one subscriber.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long a read waits for new messages before polling again.
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    10
}
fn default_concurrency() -> usize {
    1
}
fn default_block_timeout_ms() -> u64 {
    5_000
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            block_timeout_ms: default_block_timeout_ms(),
        }
    }
}

impl SubscribeOptions {
    /// Single consumer, batched: for height-ordered topics.
    pub fn ordered(batch_size: usize) -> Self {
        Self {
            batch_size,
            concurrency: 1,
            ..Self::default()
        }
    }

    /// Many consumers, one message each: for independent jobs.
    pub fn pool(concurrency: usize) -> Self {
        Self {
            batch_size: 1,
            concurrency,
            ..Self::default()
        }
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.batch_size == 0 {
            return Err(FeedError::Config("batch_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(FeedError::Config("concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

/// Cache → durable flushing of the block store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOptions {
    #[serde(default = "default_flush_interval_ms")]
    pub interval_ms: u64,
    /// Blocks moved per flush; a flush only runs once this many are cached.
    #[serde(default = "default_flush_threshold")]
    pub threshold: u64,
}

fn default_flush_interval_ms() -> u64 {
    3_000
}
fn default_flush_threshold() -> u64 {
    100
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            interval_ms: default_flush_interval_ms(),
            threshold: default_flush_threshold(),
        }
    }
}

impl FlushOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.threshold == 0 {
            return Err(FeedError::Config("flush threshold must be at least 1".into()));
        }
        if self.interval_ms == 0 {
            return Err(FeedError::Config("flush interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Everything one deployment of the pipeline needs to agree on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Chain slug (e.g. `"ethereum"`).
    pub chain_id: String,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Ingestion log consumer; concurrency is forced to 1.
    #[serde(default = "default_ingest")]
    pub ingest: SubscribeOptions,
    /// Delivery log consumers; batch size is forced to 1.
    #[serde(default = "default_delivery")]
    pub delivery: SubscribeOptions,
    #[serde(default)]
    pub block_flush: FlushOptions,
    /// Backoff for the reconnecting block producer.
    #[serde(default)]
    pub producer_retry: RetryConfig,
    /// Also publish each new height on the per-shard flush topics.
    #[serde(default)]
    pub notify_flushers: bool,
}

fn default_shard_count() -> u32 {
    1
}
fn default_ingest() -> SubscribeOptions {
    SubscribeOptions::ordered(100)
}
fn default_delivery() -> SubscribeOptions {
    SubscribeOptions::pool(10)
}

impl FeedConfig {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            shard_count: default_shard_count(),
            ingest: default_ingest(),
            delivery: default_delivery(),
            block_flush: FlushOptions::default(),
            producer_retry: RetryConfig::default(),
            notify_flushers: false,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, FeedError> {
        let mut config: Self =
            serde_json::from_str(json).map_err(|e| FeedError::Config(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FeedError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Pin the settings each role depends on for correctness.
    pub fn normalize(&mut self) {
        self.ingest.concurrency = 1;
        self.delivery.batch_size = 1;
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.chain_id.trim().is_empty() {
            return Err(FeedError::Config("chain_id must not be empty".into()));
        }
        if self.shard_count == 0 {
            return Err(FeedError::Config("shard_count must be at least 1".into()));
        }
        self.ingest.validate()?;
        self.delivery.validate()?;
        self.block_flush.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = FeedConfig::from_json_str(r#"{"chain_id": "ethereum"}"#).unwrap();
        assert_eq!(config.shard_count, 1);
        assert_eq!(config.ingest.concurrency, 1);
        assert_eq!(config.delivery.batch_size, 1);
        assert_eq!(config.block_flush.interval_ms, 3_000);
        assert_eq!(config.block_flush.threshold, 100);
        assert_eq!(config.producer_retry.max_retries, 3);
    }

    #[test]
    fn roles_are_pinned() {
        let config = FeedConfig::from_json_str(
            r#"{"chain_id": "ethereum",
                "ingest": {"batch_size": 5, "concurrency": 8},
                "delivery": {"batch_size": 50, "concurrency": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.ingest.concurrency, 1);
        assert_eq!(config.ingest.batch_size, 5);
        assert_eq!(config.delivery.batch_size, 1);
        assert_eq!(config.delivery.concurrency, 4);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(FeedConfig::from_json_str(r#"{"chain_id": ""}"#).is_err());
        assert!(FeedConfig::from_json_str(r#"{"chain_id": "eth", "shard_count": 0}"#).is_err());
        assert!(FeedConfig::from_json_str(
            r#"{"chain_id": "eth", "block_flush": {"threshold": 0}}"#
        )
        .is_err());
    }
}
