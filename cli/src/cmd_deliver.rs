//! `blockfeed deliver`: run a processor pool for one shard's delivery log.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use blockfeed_core::config::SubscribeOptions;
use blockfeed_relay::{WebhookClient, WebhookProcessor};

use crate::context::{feed_config, open_log, shard, shared_block_store};
use crate::GlobalArgs;

#[derive(Args, Debug, Clone)]
pub struct DeliverArgs {
    /// Shard index this process serves (0-based)
    #[arg(long, env = "BLOCKFEED_SHARD")]
    pub shard: u32,

    /// Consumer name prefix inside the delivery group; keep it stable
    #[arg(long, env = "BLOCKFEED_CONSUMER_NAME", default_value = "webhook-processor")]
    pub consumer_name: String,

    /// Concurrent deliveries (overrides the config file)
    #[arg(long, env = "BLOCKFEED_POOL_SIZE")]
    pub pool_size: Option<usize>,
}

pub async fn run(global: &GlobalArgs, args: DeliverArgs, cancel: CancellationToken) -> Result<()> {
    let config = feed_config(global)?;
    let log = open_log(&global.stores).await?;
    let store = shared_block_store(&global.stores, &config.chain_id).await?;
    let shard = shard(log, &config, args.shard)?;

    let opts = SubscribeOptions {
        concurrency: args.pool_size.unwrap_or(config.delivery.concurrency),
        ..config.delivery.clone()
    };
    opts.validate()?;

    let processor = Arc::new(WebhookProcessor::new(shard, store, WebhookClient::with_defaults()?));
    processor
        .run(&args.consumer_name, &opts, cancel)
        .await
        .with_context(|| format!("webhook processor for shard {} failed", args.shard))
}
