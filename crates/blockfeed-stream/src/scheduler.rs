//! Per-shard webhook scheduling.
//!
//! A webhook is always in exactly one place: waiting in its shard's pending
//! set (scored by the last height it has seen), in flight as a message on the
//! shard's delivery log, or gone. [`WebhookStream::flush`] moves waiting
//! webhooks onto the log once the chain has passed their score;
//! [`WebhookStream::ack_and_rearm`] moves a processed message back. Both are
//! single atomic backend operations.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use blockfeed_core::config::SubscribeOptions;
use blockfeed_core::error::FeedError;
use blockfeed_core::shard::{ShardId, ShardRouter, DELIVERY_GROUP};
use blockfeed_core::types::DeliveryMessage;
use blockfeed_core::webhook::{Webhook, WebhookDirectory, WebhookValidator};

use crate::backend::{
    LogBackend, MessageId, PendingEntry, PendingJob, Rearm, RearmMode, ScheduleBackend,
};
use crate::stream::{Stream, StreamHandler};

/// Scheduler and delivery log of one shard.
#[derive(Clone)]
pub struct WebhookStream {
    shard: ShardId,
    chain_id: String,
    scheduler: Arc<dyn ScheduleBackend>,
    log: Stream<DeliveryMessage>,
    validator: Arc<WebhookValidator>,
}

impl WebhookStream {
    pub fn new<B>(backend: Arc<B>, chain_id: impl Into<String>, shard: ShardId) -> Self
    where
        B: LogBackend + ScheduleBackend + 'static,
    {
        let log_backend: Arc<dyn LogBackend> = backend.clone();
        let scheduler: Arc<dyn ScheduleBackend> = backend;
        Self {
            shard,
            chain_id: chain_id.into(),
            scheduler,
            log: Stream::new(log_backend, shard.delivery_topic(), DELIVERY_GROUP),
            validator: Arc::new(WebhookValidator::default()),
        }
    }

    /// Replace the default validator with one shared across shards.
    pub fn with_validator(mut self, validator: Arc<WebhookValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn log(&self) -> &Stream<DeliveryMessage> {
        &self.log
    }

    /// Register a webhook, or update the definition of a known one without
    /// touching its schedule. A new webhook starts pending at height 0 with
    /// an `is_new` job. Returns `true` if it was new.
    pub async fn set_webhook(&self, webhook: &Webhook) -> Result<bool, FeedError> {
        self.validator.validate(webhook)?;
        if webhook.chain_id != self.chain_id {
            return Err(FeedError::validation(
                "chain_id",
                format!("'{}' does not belong on chain '{}'", webhook.chain_id, self.chain_id),
            ));
        }
        let is_new = self.scheduler.set_webhook(self.shard, webhook).await?;
        info!(shard = %self.shard, webhook_id = %webhook.id, is_new, "webhook stored");
        Ok(is_new)
    }

    pub async fn get_webhook(&self, id: &str) -> Result<Option<Webhook>, FeedError> {
        self.scheduler.get_webhook(self.shard, id).await
    }

    /// Remove a webhook and its pending job. A message already in flight is
    /// dropped by the processor when it finds the definition gone.
    pub async fn delete_webhook(&self, id: &str) -> Result<bool, FeedError> {
        let removed = self.scheduler.delete_webhook(self.shard, id).await?;
        info!(shard = %self.shard, webhook_id = id, removed, "webhook deleted");
        Ok(removed)
    }

    /// Promote every webhook that has blocks beyond its score, given the
    /// chain's newest height. Repeating a flush with the same or a lower
    /// height promotes nothing.
    pub async fn flush(&self, latest_height: u64) -> Result<Vec<PendingJob>, FeedError> {
        let promoted = self.scheduler.flush_pending(self.shard, latest_height).await?;
        if !promoted.is_empty() {
            debug!(
                shard = %self.shard,
                latest_height,
                promoted = promoted.len(),
                "pending webhooks promoted"
            );
        }
        Ok(promoted)
    }

    /// Acknowledge a delivery message and drop its job.
    pub async fn ack(&self, id: MessageId) -> Result<(), FeedError> {
        self.log.ack_del(&[id]).await
    }

    /// Acknowledge a delivery message and schedule `next` in the same step.
    pub async fn ack_and_rearm(
        &self,
        id: MessageId,
        next: &DeliveryMessage,
        mode: RearmMode,
    ) -> Result<Rearm, FeedError> {
        self.scheduler
            .ack_and_rearm(self.shard, self.log.group(), id, next, mode)
            .await
    }

    pub async fn pending_entry(&self, id: MessageId) -> Result<Option<PendingEntry>, FeedError> {
        self.log.pending_entry(id).await
    }

    pub async fn latest_flushed_height(&self) -> Result<Option<u64>, FeedError> {
        self.scheduler.latest_flushed_height(self.shard).await
    }

    pub async fn pending_jobs(&self) -> Result<Vec<PendingJob>, FeedError> {
        self.scheduler.pending_jobs(self.shard).await
    }

    /// Consume this shard's delivery log.
    pub async fn subscribe<H>(
        &self,
        consumer_name: &str,
        opts: &SubscribeOptions,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError>
    where
        H: StreamHandler<DeliveryMessage> + 'static,
    {
        self.log.subscribe(consumer_name, opts, handler, cancel).await
    }
}

#[async_trait]
impl WebhookDirectory for WebhookStream {
    async fn find_webhook(&self, id: &str) -> Result<Option<Webhook>, FeedError> {
        self.get_webhook(id).await
    }
}

// ─── Shard set ───────────────────────────────────────────────────────────────

/// Every shard of one chain plus the router that places webhooks on them.
#[derive(Clone)]
pub struct ShardSet {
    router: ShardRouter,
    shards: Vec<WebhookStream>,
}

impl ShardSet {
    /// All shards on one shared backend.
    pub fn new<B>(backend: Arc<B>, chain_id: &str, router: ShardRouter) -> Self
    where
        B: LogBackend + ScheduleBackend + 'static,
    {
        let shards = router
            .shards()
            .map(|shard| WebhookStream::new(backend.clone(), chain_id, shard))
            .collect();
        Self { router, shards }
    }

    /// Shards backed by independent stores. `shards[i]` must be shard `i`.
    pub fn from_shards(router: ShardRouter, shards: Vec<WebhookStream>) -> Result<Self, FeedError> {
        if shards.len() != router.shard_count() as usize
            || shards.iter().enumerate().any(|(i, s)| s.shard().0 as usize != i)
        {
            return Err(FeedError::Config(format!(
                "expected shards 0..{} in order",
                router.shard_count()
            )));
        }
        Ok(Self { router, shards })
    }

    pub fn with_validator(self, validator: Arc<WebhookValidator>) -> Self {
        Self {
            router: self.router,
            shards: self
                .shards
                .into_iter()
                .map(|s| s.with_validator(validator.clone()))
                .collect(),
        }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn shards(&self) -> &[WebhookStream] {
        &self.shards
    }

    pub fn shard(&self, id: ShardId) -> Option<&WebhookStream> {
        self.shards.get(id.0 as usize)
    }

    /// The shard a webhook id routes to.
    pub fn for_webhook(&self, webhook_id: &str) -> &WebhookStream {
        &self.shards[self.router.shard_for(webhook_id).0 as usize]
    }

    /// Flush every shard with the same height, concurrently.
    pub async fn flush_all(&self, latest_height: u64) -> Result<usize, FeedError> {
        let promoted = try_join_all(self.shards.iter().map(|s| s.flush(latest_height))).await?;
        Ok(promoted.iter().map(Vec::len).sum())
    }
}

#[async_trait]
impl WebhookDirectory for ShardSet {
    async fn find_webhook(&self, id: &str) -> Result<Option<Webhook>, FeedError> {
        self.for_webhook(id).get_webhook(id).await
    }
}
