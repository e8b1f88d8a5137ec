//! Webhook delivery processor.
//!
//! Consumes one shard's delivery log, one message per consumer at a time.
//! For each message it looks the webhook up, fetches its block range, POSTs
//! it, then acks the message and re-arms the webhook in a single scheduler
//! operation. Any error before that ack leaves the message in the consumer's
//! backlog, where it is redelivered with a higher retry count.
//!
//! A range that keeps failing is skipped one height at a time once its retry
//! count reaches the webhook's `max_retries`.
//!
//! When a range comes back empty the processor decides why:
//!
//! - nothing stored yet, or the range starts above the newest stored height:
//!   the webhook waits in the pending set for the next flush;
//! - the range starts below the earliest retained height: fast-forward to it;
//! - otherwise the store has a hole there: skip past the range.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blockfeed_core::config::SubscribeOptions;
use blockfeed_core::error::FeedError;
use blockfeed_core::store::BlockStore;
use blockfeed_core::types::{Block, DeliveryMessage};
use blockfeed_core::webhook::{Webhook, WebhookDirectory};
use blockfeed_stream::{
    MessageBatch, MessageId, Rearm, RearmMode, StreamHandler, StreamMessage, WebhookStream,
};

use crate::client::WebhookClient;

pub struct WebhookProcessor {
    shard: WebhookStream,
    directory: Arc<dyn WebhookDirectory>,
    store: Arc<dyn BlockStore>,
    client: WebhookClient,
}

impl WebhookProcessor {
    /// Webhook definitions are read from the shard's own store.
    pub fn new(shard: WebhookStream, store: Arc<dyn BlockStore>, client: WebhookClient) -> Self {
        Self {
            directory: Arc::new(shard.clone()),
            shard,
            store,
            client,
        }
    }

    /// Look webhooks up somewhere other than the shard store.
    pub fn with_directory(mut self, directory: Arc<dyn WebhookDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Consume the shard's delivery log until cancelled. Batch size is
    /// always 1; `opts.concurrency` sets the pool size.
    pub async fn run(
        self: &Arc<Self>,
        consumer_name: &str,
        opts: &SubscribeOptions,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let opts = SubscribeOptions {
            batch_size: 1,
            ..opts.clone()
        };
        info!(
            shard = %self.shard.shard(),
            chain_id = self.shard.chain_id(),
            pool = opts.concurrency,
            "webhook processor started"
        );
        self.shard
            .subscribe(consumer_name, &opts, self.clone(), cancel)
            .await
    }

    async fn process(
        &self,
        msg: &StreamMessage<DeliveryMessage>,
        is_backlog: bool,
    ) -> Result<(), FeedError> {
        let job = &msg.data;
        let Some(webhook) = self.directory.find_webhook(&job.webhook_id).await? else {
            info!(webhook_id = %job.webhook_id, "webhook no longer exists, dropping job");
            return self.shard.ack(msg.id).await;
        };

        if is_backlog {
            let Some(entry) = self.shard.pending_entry(msg.id).await? else {
                debug!(message_id = %msg.id, "backlog entry already settled");
                return Ok(());
            };
            if entry.retry_count() >= webhook.max_retries {
                return self.skip_range(msg.id, job, entry.retry_count()).await;
            }
        }

        let blocks = self.fetch(&webhook, job).await?;
        debug!(
            webhook_id = %webhook.id,
            is_new = job.is_new,
            from = job.block_height,
            fetched = blocks.len(),
            "blocks fetched"
        );
        let Some(last) = blocks.last().map(|b| b.height) else {
            return self.starved(msg.id, &webhook, job).await;
        };

        self.client.deliver(&webhook, &blocks).await?;

        let next = DeliveryMessage::at(&webhook.id, last + 1);
        let outcome = self.rearm(msg.id, &next, RearmMode::Schedule).await?;
        info!(
            webhook_id = %webhook.id,
            blocks = blocks.len(),
            last_height = last,
            rearmed = ?outcome,
            "webhook delivered"
        );
        Ok(())
    }

    /// The webhook's range, oldest first.
    async fn fetch(&self, webhook: &Webhook, job: &DeliveryMessage) -> Result<Vec<Block>, FeedError> {
        let mut blocks = if job.is_new {
            self.store
                .get_latest_blocks(&webhook.chain_id, i64::from(webhook.max_blocks))
                .await?
        } else {
            self.store
                .get_blocks(
                    &webhook.chain_id,
                    job.block_height,
                    job.range_end(webhook.max_blocks),
                )
                .await?
        };
        blocks.sort_by_key(|b| b.height);
        Ok(blocks)
    }

    /// Give up on the current range and move one height forward.
    async fn skip_range(
        &self,
        id: MessageId,
        job: &DeliveryMessage,
        retry_count: u32,
    ) -> Result<(), FeedError> {
        let next = if job.is_new {
            // A new webhook has no range yet; start after whatever is newest.
            match self.store.get_latest_block(self.shard.chain_id()).await? {
                Some(latest) => DeliveryMessage::at(&job.webhook_id, latest.height + 1),
                None => job.clone(),
            }
        } else {
            DeliveryMessage::at(&job.webhook_id, job.block_height + 1)
        };
        warn!(
            webhook_id = %job.webhook_id,
            height = job.block_height,
            retry_count,
            next_height = next.block_height,
            "retries exhausted, skipping range"
        );
        self.rearm(id, &next, RearmMode::Schedule).await.map(|_| ())
    }

    async fn starved(
        &self,
        id: MessageId,
        webhook: &Webhook,
        job: &DeliveryMessage,
    ) -> Result<(), FeedError> {
        let latest = self.store.get_latest_block(&webhook.chain_id).await?;
        let behind_head = match &latest {
            None => true,
            Some(_) if job.is_new => true,
            Some(b) => job.block_height > b.height,
        };
        if behind_head {
            debug!(webhook_id = %webhook.id, height = job.block_height, "waiting for blocks");
            return self.rearm(id, job, RearmMode::Wait).await.map(|_| ());
        }

        let earliest = self.store.get_earliest_height(&webhook.chain_id).await?;
        let next = match earliest {
            Some(earliest) if job.block_height < earliest => {
                warn!(
                    webhook_id = %webhook.id,
                    height = job.block_height,
                    earliest,
                    "range no longer retained, fast-forwarding"
                );
                DeliveryMessage::at(&webhook.id, earliest)
            }
            _ => {
                let skip_to = job.range_end(webhook.max_blocks) + 1;
                warn!(
                    webhook_id = %webhook.id,
                    height = job.block_height,
                    next_height = skip_to,
                    "no blocks stored in range, skipping"
                );
                DeliveryMessage::at(&webhook.id, skip_to)
            }
        };
        self.rearm(id, &next, RearmMode::Schedule).await.map(|_| ())
    }

    async fn rearm(
        &self,
        id: MessageId,
        next: &DeliveryMessage,
        mode: RearmMode,
    ) -> Result<Rearm, FeedError> {
        self.shard.ack_and_rearm(id, next, mode).await
    }
}

#[async_trait]
impl StreamHandler<DeliveryMessage> for WebhookProcessor {
    async fn handle(&self, batch: MessageBatch<DeliveryMessage>) -> Result<(), FeedError> {
        for msg in &batch.messages {
            self.process(msg, batch.is_backlog).await?;
        }
        Ok(())
    }
}
