//! `blockfeed webhook`: register, inspect, or remove a webhook on the shard
//! its id routes to.

use anyhow::{bail, Result};
use clap::Subcommand;
use serde_json::json;

use blockfeed_core::webhook::Webhook;

use crate::context::{feed_config, open_log, shard_set};
use crate::GlobalArgs;

#[derive(Subcommand, Debug, Clone)]
pub enum WebhookAction {
    /// Create a webhook, or update an existing one without moving its cursor
    Set {
        #[arg(long)]
        id: String,
        /// Endpoint receiving POSTed block batches
        #[arg(long)]
        url: String,
        /// Redeliveries tolerated before a range is skipped
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        /// Most blocks per request
        #[arg(long, default_value_t = 10)]
        max_blocks: u32,
        /// Per-request timeout
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Print a webhook definition and its shard
    Get {
        #[arg(long)]
        id: String,
    },
    /// Delete a webhook and its pending job
    Rm {
        #[arg(long)]
        id: String,
    },
}

pub async fn run(global: &GlobalArgs, action: WebhookAction) -> Result<()> {
    let config = feed_config(global)?;
    let shards = shard_set(open_log(&global.stores).await?, &config)?;

    match action {
        WebhookAction::Set {
            id,
            url,
            max_retries,
            max_blocks,
            timeout_ms,
        } => {
            let webhook = Webhook {
                id,
                url,
                chain_id: config.chain_id.clone(),
                max_retries,
                max_blocks,
                timeout_ms,
            };
            let shard = shards.for_webhook(&webhook.id);
            let created = shard.set_webhook(&webhook).await?;
            print_json(&json!({
                "shard": shard.shard().0,
                "created": created,
                "webhook": webhook,
            }))
        }
        WebhookAction::Get { id } => {
            let shard = shards.for_webhook(&id);
            let Some(webhook) = shard.get_webhook(&id).await? else {
                bail!("webhook '{id}' not found");
            };
            let pending = shard
                .pending_jobs()
                .await?
                .into_iter()
                .find(|job| job.webhook_id == id);
            print_json(&json!({
                "shard": shard.shard().0,
                "webhook": webhook,
                "pending": pending.map(|job| json!({ "score": job.score, "next": job.message })),
            }))
        }
        WebhookAction::Rm { id } => {
            let shard = shards.for_webhook(&id);
            let removed = shard.delete_webhook(&id).await?;
            print_json(&json!({ "shard": shard.shard().0, "removed": removed }))
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
