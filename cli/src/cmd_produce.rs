//! `blockfeed produce`: follow an EVM node and append its blocks to the
//! chain's ingestion log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use blockfeed_core::store::BlockStore;
use blockfeed_evm::{EvmBlockSource, HttpEvmClient, SourceOptions};
use blockfeed_relay::{block_log, BlockProducer};

use crate::context::{feed_config, open_log, shared_block_store};
use crate::GlobalArgs;

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Time between head polls once caught up
    #[arg(long, env = "BLOCKFEED_POLL_INTERVAL_MS", default_value_t = 2_000)]
    pub poll_interval_ms: u64,

    /// Blocks to stay behind the node's head
    #[arg(long, env = "BLOCKFEED_CONFIRMATIONS", default_value_t = 0)]
    pub confirmations: u64,

    /// Timeout for a single JSON-RPC request
    #[arg(long, env = "BLOCKFEED_RPC_TIMEOUT_MS", default_value_t = 10_000)]
    pub rpc_timeout_ms: u64,
}

impl SourceArgs {
    pub fn client(&self, rpc_url: &str) -> Result<HttpEvmClient> {
        HttpEvmClient::new(rpc_url, Duration::from_millis(self.rpc_timeout_ms))
            .with_context(|| format!("building RPC client for {rpc_url}"))
    }

    pub fn options(&self) -> SourceOptions {
        SourceOptions {
            poll_interval_ms: self.poll_interval_ms,
            confirmation_depth: self.confirmations,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProduceArgs {
    /// EVM JSON-RPC endpoint
    #[arg(long, env = "BLOCKFEED_RPC_URL")]
    pub rpc_url: String,

    /// First height to publish (default: newest stored block)
    #[arg(long, env = "BLOCKFEED_START_HEIGHT")]
    pub start_height: Option<u64>,

    #[command(flatten)]
    pub source: SourceArgs,
}

pub async fn run(global: &GlobalArgs, args: ProduceArgs, cancel: CancellationToken) -> Result<()> {
    let config = feed_config(global)?;
    let log = open_log(&global.stores).await?;
    let store: Arc<dyn BlockStore> = shared_block_store(&global.stores, &config.chain_id).await?;

    let source = EvmBlockSource::new(
        config.chain_id.clone(),
        args.source.client(&args.rpc_url)?,
        args.source.options(),
    );
    info!(chain_id = %config.chain_id, rpc_url = %args.rpc_url, "starting block producer");

    BlockProducer::new(source, block_log(log, &config.chain_id), store)
        .with_retry(config.producer_retry.clone())
        .run(args.start_height, cancel)
        .await
        .context("block producer failed")
}
