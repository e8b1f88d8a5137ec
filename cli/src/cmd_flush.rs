//! `blockfeed flush-blocks` and `blockfeed flush-webhooks`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use blockfeed_core::config::SubscribeOptions;
use blockfeed_relay::{flush_notices, WebhookFlusher};

use crate::context::{feed_config, open_log, shard, shared_block_store};
use crate::GlobalArgs;

#[derive(Args, Debug, Clone)]
pub struct FlushWebhooksArgs {
    /// Shard index whose pending set this process flushes (0-based)
    #[arg(long, env = "BLOCKFEED_SHARD")]
    pub shard: u32,

    /// Consumer name inside the flusher group; keep it stable
    #[arg(long, env = "BLOCKFEED_CONSUMER_NAME", default_value = "webhook-flusher")]
    pub consumer_name: String,
}

/// Move cached blocks to durable storage until cancelled. Only one block
/// flusher may run per chain.
pub async fn run_blocks(global: &GlobalArgs, cancel: CancellationToken) -> Result<()> {
    let config = feed_config(global)?;
    let store = shared_block_store(&global.stores, &config.chain_id).await?;
    store
        .start_flushing(&config.chain_id, config.block_flush.clone(), cancel)
        .await
        .context("block flusher failed")
}

pub async fn run_webhooks(
    global: &GlobalArgs,
    args: FlushWebhooksArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let config = feed_config(global)?;
    let log = open_log(&global.stores).await?;
    let shard = shard(log.clone(), &config, args.shard)?;
    let notices = flush_notices(log, shard.shard());

    let flusher = Arc::new(WebhookFlusher::new(shard, notices));
    flusher
        .run(&args.consumer_name, &SubscribeOptions::ordered(100), cancel)
        .await
        .with_context(|| format!("webhook flusher for shard {} failed", args.shard))
}
