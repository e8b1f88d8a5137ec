//! `blockfeed run`: every role in one process.
//!
//! Logs, scheduler state and both block tiers live in SQLite, so a restart
//! picks up where it stopped. Ingestion acks a batch once it is in the cache
//! table, which is why the cache must outlive the process too.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use blockfeed_core::store::BlockStore;
use blockfeed_evm::EvmBlockSource;
use blockfeed_relay::{block_log, BlockProducer, IngestionConsumer, WebhookClient, WebhookProcessor};

use crate::cmd_produce::SourceArgs;
use crate::context::{feed_config, open_log, shard_set, shared_block_store};
use crate::GlobalArgs;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// EVM JSON-RPC endpoint
    #[arg(long, env = "BLOCKFEED_RPC_URL")]
    pub rpc_url: String,

    /// First height to publish (default: newest stored block)
    #[arg(long, env = "BLOCKFEED_START_HEIGHT")]
    pub start_height: Option<u64>,

    #[command(flatten)]
    pub source: SourceArgs,
}

pub async fn run(global: &GlobalArgs, args: RunArgs, cancel: CancellationToken) -> Result<()> {
    let config = feed_config(global)?;
    let chain_id = config.chain_id.clone();
    let log = open_log(&global.stores).await?;
    let store = shared_block_store(&global.stores, &chain_id).await?;
    let shards = shard_set(log.clone(), &config)?;
    let blocks = block_log(log.clone(), &chain_id);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    {
        let store = store.clone();
        let chain_id = chain_id.clone();
        let opts = config.block_flush.clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            store
                .start_flushing(&chain_id, opts, token)
                .await
                .context("block flusher failed")
        });
    }

    {
        let ingest = Arc::new(IngestionConsumer::new(
            chain_id.clone(),
            blocks.clone(),
            store.clone(),
            shards.clone(),
        ));
        let opts = config.ingest.clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            ingest
                .run("block-consumer", &opts, token)
                .await
                .context("block ingestion failed")
        });
    }

    for shard in shards.shards() {
        let processor = Arc::new(WebhookProcessor::new(
            shard.clone(),
            store.clone(),
            WebhookClient::with_defaults()?,
        ));
        let consumer = format!("webhook-processor-{}", shard.shard());
        let opts = config.delivery.clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            processor
                .run(&consumer, &opts, token)
                .await
                .context("webhook processor failed")
        });
    }

    {
        let source = EvmBlockSource::new(
            chain_id.clone(),
            args.source.client(&args.rpc_url)?,
            args.source.options(),
        );
        let resume_from: Arc<dyn BlockStore> = store.clone();
        let producer =
            BlockProducer::new(source, blocks, resume_from).with_retry(config.producer_retry.clone());
        let start = args.start_height;
        let token = cancel.clone();
        tasks.spawn(async move {
            producer
                .run(start, token)
                .await
                .context("block producer failed")
        });
    }

    info!(chain_id = %chain_id, shards = shards.shards().len(), rpc_url = %args.rpc_url, "all roles started");

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(anyhow::Error::from).and_then(|r| r);
        if let Err(e) = result {
            if first_error.is_none() {
                error!(error = %format!("{e:#}"), "role failed, stopping the rest");
                cancel.cancel();
                first_error = Some(e);
            }
        } else if !cancel.is_cancelled() {
            // A role returning on its own leaves the pipeline incomplete.
            cancel.cancel();
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
