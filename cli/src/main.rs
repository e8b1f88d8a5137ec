//! blockfeed CLI: each subcommand runs one process role of the pipeline.
//!
//! # Commands
//! ```text
//! blockfeed produce         --rpc-url <url> [--start-height <h>]
//! blockfeed consume-blocks  [--notify-flushers]
//! blockfeed deliver         --shard <n> [--pool-size <n>]
//! blockfeed flush-blocks
//! blockfeed flush-webhooks  --shard <n>
//! blockfeed webhook set|get|rm --id <id> ...
//! blockfeed run             --rpc-url <url>
//! ```
//!
//! Every flag can also be set through its `BLOCKFEED_*` environment
//! variable. Long-running roles stop cleanly on Ctrl-C or SIGTERM.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod cmd_deliver;
mod cmd_flush;
mod cmd_ingest;
mod cmd_produce;
mod cmd_run;
mod cmd_webhook;
mod context;
mod logging;

use context::StoreArgs;
use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "blockfeed",
    about = "Stream chain blocks to webhooks: BlockFeed CLI",
    long_about = "
BlockFeed follows a chain node, stores its blocks, and POSTs them to
registered webhooks in order with bounded retries.

ENVIRONMENT VARIABLES:
  BLOCKFEED_CHAIN_ID      Chain slug every role works on
  BLOCKFEED_LOG_DB        SQLite file holding the logs and schedulers
  BLOCKFEED_BLOCK_DB      SQLite file holding durable blocks
  BLOCKFEED_RPC_URL       EVM JSON-RPC endpoint (produce, run)
  RUST_LOG                Overrides --log-level
",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// JSON file with a full pipeline configuration
    #[arg(long, global = true, env = "BLOCKFEED_CONFIG")]
    pub config: Option<String>,

    /// Chain slug (overrides the config file)
    #[arg(long, global = true, env = "BLOCKFEED_CHAIN_ID")]
    pub chain_id: Option<String>,

    /// Number of scheduler shards (overrides the config file)
    #[arg(long, global = true, env = "BLOCKFEED_SHARD_COUNT")]
    pub shard_count: Option<u32>,

    #[command(flatten)]
    pub stores: StoreArgs,

    /// Default log level
    #[arg(long, global = true, env = "BLOCKFEED_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Per-crate log levels, e.g. blockfeed-relay=debug
    #[arg(long = "log-component", global = true, value_name = "CRATE=LEVEL")]
    pub log_components: Vec<String>,

    /// Emit JSON logs
    #[arg(long, global = true, env = "BLOCKFEED_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow an EVM node and publish its blocks to the ingestion log
    Produce(cmd_produce::ProduceArgs),

    /// Store ingested blocks and flush every shard's pending set
    #[command(name = "consume-blocks")]
    ConsumeBlocks(cmd_ingest::IngestArgs),

    /// Deliver one shard's webhooks
    Deliver(cmd_deliver::DeliverArgs),

    /// Move cached blocks to durable storage
    #[command(name = "flush-blocks")]
    FlushBlocks,

    /// Flush one shard's pending set from flush notices
    #[command(name = "flush-webhooks")]
    FlushWebhooks(cmd_flush::FlushWebhooksArgs),

    /// Register, inspect, or remove webhooks
    Webhook {
        #[command(subcommand)]
        action: cmd_webhook::WebhookAction,
    },

    /// Run every role in one process
    Run(cmd_run::RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log = LogConfig {
        level: cli.global.log_level.clone(),
        json: cli.global.log_json,
        ..LogConfig::default()
    }
    .with_components(&cli.global.log_components)?;
    init_tracing(&log)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    match cli.command {
        Commands::Produce(args) => cmd_produce::run(&cli.global, args, cancel).await,
        Commands::ConsumeBlocks(args) => cmd_ingest::run(&cli.global, args, cancel).await,
        Commands::Deliver(args) => cmd_deliver::run(&cli.global, args, cancel).await,
        Commands::FlushBlocks => cmd_flush::run_blocks(&cli.global, cancel).await,
        Commands::FlushWebhooks(args) => cmd_flush::run_webhooks(&cli.global, args, cancel).await,
        Commands::Webhook { action } => cmd_webhook::run(&cli.global, action).await,
        Commands::Run(args) => cmd_run::run(&cli.global, args, cancel).await,
    }
}

async fn cancel_on_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
    cancel.cancel();
}
