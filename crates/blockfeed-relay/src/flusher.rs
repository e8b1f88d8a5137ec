//! Flush-notice bus and the per-shard flusher service.
//!
//! When scheduler shards are flushed by their own processes, the ingestion
//! consumer publishes the newest height on each shard's flush topic, capped
//! at one entry so only the latest notice survives. A [`WebhookFlusher`]
//! consumes that topic and flushes its shard whenever the height moves past
//! the last one it flushed.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use blockfeed_core::config::SubscribeOptions;
use blockfeed_core::error::FeedError;
use blockfeed_core::shard::ShardId;
use blockfeed_stream::{LogBackend, MessageBatch, Stream, StreamHandler, WebhookStream};

/// Consumer group of the flush topics.
pub const FLUSH_GROUP: &str = "webhook-flushers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushNotice {
    pub block_height: u64,
}

/// Typed handle on `shard`'s flush topic.
pub fn flush_notices(backend: Arc<dyn LogBackend>, shard: ShardId) -> Stream<FlushNotice> {
    Stream::new(backend, shard.flush_topic(), FLUSH_GROUP)
}

pub struct WebhookFlusher {
    shard: WebhookStream,
    notices: Stream<FlushNotice>,
    last_flushed: Mutex<Option<u64>>,
}

impl WebhookFlusher {
    pub fn new(shard: WebhookStream, notices: Stream<FlushNotice>) -> Self {
        Self {
            shard,
            notices,
            last_flushed: Mutex::new(None),
        }
    }

    pub fn last_flushed(&self) -> Result<Option<u64>, FeedError> {
        self.last_flushed
            .lock()
            .map(|g| *g)
            .map_err(|e| FeedError::Other(e.to_string()))
    }

    pub async fn run(
        self: &Arc<Self>,
        consumer_name: &str,
        opts: &SubscribeOptions,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let opts = SubscribeOptions {
            concurrency: 1,
            ..opts.clone()
        };
        info!(shard = %self.shard.shard(), topic = %self.notices.topic(), "webhook flusher started");
        self.notices
            .subscribe(consumer_name, &opts, self.clone(), cancel)
            .await
    }
}

#[async_trait]
impl StreamHandler<FlushNotice> for WebhookFlusher {
    async fn handle(&self, batch: MessageBatch<FlushNotice>) -> Result<(), FeedError> {
        let Some(height) = batch.messages.iter().map(|m| m.data.block_height).max() else {
            return Ok(());
        };

        let last = self.last_flushed()?;
        if last.map_or(true, |l| height > l) {
            let promoted = self.shard.flush(height).await?;
            *self
                .last_flushed
                .lock()
                .map_err(|e| FeedError::Other(e.to_string()))? = Some(height);
            debug!(shard = %self.shard.shard(), height, promoted = promoted.len(), "shard flushed");
        }
        self.notices.ack_del(&batch.ids()).await
    }
}
