//! Ingestion consumer: moves blocks from the ingestion log into the block
//! store and advances every shard's scheduler.
//!
//! Per batch the blocks are stored, then every shard is flushed with the
//! batch's highest height, and only then are the log entries acked. Both
//! steps are idempotent, so a crash anywhere replays the batch harmlessly.
//! Exactly one consumer should run per chain.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use blockfeed_core::config::SubscribeOptions;
use blockfeed_core::error::FeedError;
use blockfeed_core::store::BlockStore;
use blockfeed_core::types::Block;
use blockfeed_stream::{MessageBatch, ShardSet, Stream, StreamHandler};

use crate::flusher::FlushNotice;

pub struct IngestionConsumer {
    chain_id: String,
    log: Stream<Block>,
    store: Arc<dyn BlockStore>,
    shards: ShardSet,
    notices: Vec<Stream<FlushNotice>>,
}

impl IngestionConsumer {
    pub fn new(
        chain_id: impl Into<String>,
        log: Stream<Block>,
        store: Arc<dyn BlockStore>,
        shards: ShardSet,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            log,
            store,
            shards,
            notices: Vec::new(),
        }
    }

    /// Also publish each batch's height on these flush topics.
    pub fn with_flush_notices(mut self, notices: Vec<Stream<FlushNotice>>) -> Self {
        self.notices = notices;
        self
    }

    /// Consume the ingestion log until cancelled. Concurrency is always 1.
    pub async fn run(
        self: &Arc<Self>,
        consumer_name: &str,
        opts: &SubscribeOptions,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        self.store.init(&self.chain_id).await?;
        let opts = SubscribeOptions {
            concurrency: 1,
            ..opts.clone()
        };
        self.log
            .subscribe(consumer_name, &opts, self.clone(), cancel)
            .await
    }
}

#[async_trait]
impl StreamHandler<Block> for IngestionConsumer {
    async fn handle(&self, batch: MessageBatch<Block>) -> Result<(), FeedError> {
        let ids = batch.ids();
        let blocks: Vec<Block> = batch.messages.into_iter().map(|m| m.data).collect();
        let Some(latest) = blocks.iter().map(|b| b.height).max() else {
            return Ok(());
        };

        self.store.put_blocks(&self.chain_id, &blocks).await?;
        let promoted = self.shards.flush_all(latest).await?;
        for notices in &self.notices {
            notices
                .publish_capped(&FlushNotice { block_height: latest }, 1)
                .await?;
        }
        self.log.ack_del(&ids).await?;

        info!(
            chain_id = %self.chain_id,
            blocks = blocks.len(),
            latest,
            promoted,
            backlog = batch.is_backlog,
            "blocks ingested"
        );
        Ok(())
    }
}
