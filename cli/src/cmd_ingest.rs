//! `blockfeed consume-blocks`: store ingested blocks and promote every
//! shard's due webhooks.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use blockfeed_core::config::SubscribeOptions;
use blockfeed_relay::{block_log, flush_notices, IngestionConsumer};

use crate::context::{feed_config, open_log, shard_set, shared_block_store};
use crate::GlobalArgs;

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Consumer name inside the ingestion group; keep it stable across restarts
    #[arg(long, env = "BLOCKFEED_CONSUMER_NAME", default_value = "block-consumer")]
    pub consumer_name: String,

    /// Blocks stored per batch (overrides the config file)
    #[arg(long, env = "BLOCKFEED_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Publish each new height on the per-shard flush topics
    #[arg(long, env = "BLOCKFEED_NOTIFY_FLUSHERS")]
    pub notify_flushers: bool,
}

pub async fn run(global: &GlobalArgs, args: IngestArgs, cancel: CancellationToken) -> Result<()> {
    let config = feed_config(global)?;
    let log = open_log(&global.stores).await?;
    let store = shared_block_store(&global.stores, &config.chain_id).await?;
    let shards = shard_set(log.clone(), &config)?;

    let opts = SubscribeOptions {
        batch_size: args.batch_size.unwrap_or(config.ingest.batch_size),
        ..config.ingest.clone()
    };
    opts.validate()?;

    let mut consumer = IngestionConsumer::new(
        config.chain_id.clone(),
        block_log(log.clone(), &config.chain_id),
        store,
        shards.clone(),
    );
    if args.notify_flushers || config.notify_flushers {
        let notices = shards
            .router()
            .shards()
            .map(|id| flush_notices(log.clone(), id))
            .collect();
        consumer = consumer.with_flush_notices(notices);
    }

    info!(
        chain_id = %config.chain_id,
        consumer = %args.consumer_name,
        batch_size = opts.batch_size,
        shards = shards.shards().len(),
        "starting block ingestion"
    );
    Arc::new(consumer)
        .run(&args.consumer_name, &opts, cancel)
        .await
        .context("block ingestion failed")
}
