//! Opening the shared backends every role works against.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use tracing::info;

use blockfeed_core::config::FeedConfig;
use blockfeed_core::shard::ShardRouter;
use blockfeed_core::store::{BlockStore, CacheTier};
use blockfeed_core::webhook::WebhookValidator;
use blockfeed_storage::{CachedBlockStore, SqliteBlockStore};
use blockfeed_stream::{ShardSet, SqliteLog, WebhookStream};

use crate::GlobalArgs;

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// SQLite file holding the append logs and scheduler state
    #[arg(long, global = true, env = "BLOCKFEED_LOG_DB", default_value = "blockfeed-log.db")]
    pub log_db: String,

    /// SQLite file holding durable blocks
    #[arg(long, global = true, env = "BLOCKFEED_BLOCK_DB", default_value = "blockfeed-blocks.db")]
    pub block_db: String,

    /// SQLite file for the shared block cache (default: --block-db)
    #[arg(long, global = true, env = "BLOCKFEED_CACHE_DB")]
    pub cache_db: Option<String>,

    /// Keep durable blocks in PostgreSQL instead of --block-db
    #[arg(long, global = true, env = "BLOCKFEED_POSTGRES_URL")]
    pub postgres_url: Option<String>,
}

/// Load the config file if given, then apply flag overrides.
pub fn feed_config(global: &GlobalArgs) -> Result<FeedConfig> {
    let mut config = match &global.config {
        Some(path) => {
            FeedConfig::from_json_file(path).with_context(|| format!("loading config from {path}"))?
        }
        None => {
            let chain_id = global
                .chain_id
                .clone()
                .ok_or_else(|| anyhow!("--chain-id (or BLOCKFEED_CHAIN_ID) is required without --config"))?;
            FeedConfig::new(chain_id)
        }
    };
    if let Some(chain_id) = &global.chain_id {
        config.chain_id = chain_id.clone();
    }
    if let Some(count) = global.shard_count {
        config.shard_count = count;
    }
    config.normalize();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

pub async fn open_log(stores: &StoreArgs) -> Result<Arc<SqliteLog>> {
    let log = SqliteLog::open(&stores.log_db)
        .await
        .with_context(|| format!("opening log database {}", stores.log_db))?;
    Ok(Arc::new(log))
}

pub async fn durable_store(stores: &StoreArgs) -> Result<Arc<dyn BlockStore>> {
    if let Some(url) = &stores.postgres_url {
        return postgres_store(url).await;
    }
    let store = SqliteBlockStore::open(&stores.block_db)
        .await
        .with_context(|| format!("opening block database {}", stores.block_db))?;
    Ok(Arc::new(store))
}

#[cfg(feature = "postgres")]
async fn postgres_store(url: &str) -> Result<Arc<dyn BlockStore>> {
    let store = blockfeed_storage::PostgresBlockStore::connect(url)
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn postgres_store(_url: &str) -> Result<Arc<dyn BlockStore>> {
    anyhow::bail!("--postgres-url needs a build with the `postgres` feature")
}

/// Two-tier store with a SQLite cache shared between processes.
pub async fn shared_block_store(stores: &StoreArgs, chain_id: &str) -> Result<Arc<CachedBlockStore>> {
    let cache_path = stores.cache_db.as_deref().unwrap_or(&stores.block_db);
    let cache: Arc<dyn CacheTier> = Arc::new(
        SqliteBlockStore::open_cache(cache_path)
            .await
            .with_context(|| format!("opening block cache {cache_path}"))?,
    );
    let store = Arc::new(CachedBlockStore::new(cache, durable_store(stores).await?));
    store.init(chain_id).await?;
    Ok(store)
}

pub fn shard_set(log: Arc<SqliteLog>, config: &FeedConfig) -> Result<ShardSet> {
    let router = ShardRouter::new(config.shard_count)?;
    Ok(ShardSet::new(log, &config.chain_id, router).with_validator(Arc::new(WebhookValidator::default())))
}

pub fn shard(log: Arc<SqliteLog>, config: &FeedConfig, index: u32) -> Result<WebhookStream> {
    let router = ShardRouter::new(config.shard_count)?;
    let id = router.assigned(index)?;
    info!(chain_id = %config.chain_id, shard = %id, shard_count = config.shard_count, "using shard");
    Ok(WebhookStream::new(log, config.chain_id.clone(), id))
}

#[cfg(test)]
mod tests {
    use blockfeed_core::types::Block;

    use super::*;

    fn stores(dir: &tempfile::TempDir) -> StoreArgs {
        let path = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
        StoreArgs {
            log_db: path("log.db"),
            block_db: path("blocks.db"),
            cache_db: Some(path("cache.db")),
            postgres_url: None,
        }
    }

    #[tokio::test]
    async fn cached_blocks_survive_a_restart_without_flushing() {
        let dir = tempfile::tempdir().unwrap();
        let args = stores(&dir);
        {
            let store = shared_block_store(&args, "eth").await.unwrap();
            let blocks: Vec<Block> = (1..=3).map(|h| Block::new(h, format!("{{\"n\":{h}}}"))).collect();
            store.put_blocks("eth", &blocks).await.unwrap();
        }

        let reopened = shared_block_store(&args, "eth").await.unwrap();
        assert_eq!(reopened.cache().count_blocks("eth").await.unwrap(), 3);
        assert!(reopened.durable().get_latest_block("eth").await.unwrap().is_none());
        let heights: Vec<u64> = reopened
            .get_blocks("eth", 1, 10)
            .await
            .unwrap()
            .iter()
            .map(|b| b.height)
            .collect();
        assert_eq!(heights, vec![1, 2, 3]);
    }
}
