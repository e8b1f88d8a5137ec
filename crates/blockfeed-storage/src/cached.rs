//! Two-tier block store: a bounded cache tier in front of a durable tier.
//!
//! Writes land in the cache. [`CachedBlockStore::start_flushing`] moves the
//! oldest cached blocks into the durable tier on a timer, or sooner once a
//! write pushes the cache past the threshold. A block is deleted from the
//! cache only after the durable write that covers it has succeeded.
//!
//! Reads merge both tiers, so callers never see which tier answered.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blockfeed_core::config::FlushOptions;
use blockfeed_core::error::FeedError;
use blockfeed_core::store::{BlockStore, CacheTier};
use blockfeed_core::types::Block;

struct FlusherSlot {
    threshold: u64,
    wake: Arc<Notify>,
}

pub struct CachedBlockStore {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn BlockStore>,
    /// Chains with a running flusher. At most one flusher per chain.
    flushers: Mutex<HashMap<String, FlusherSlot>>,
}

/// Releases the chain's flusher slot when the flush loop exits.
struct FlusherGuard<'a> {
    flushers: &'a Mutex<HashMap<String, FlusherSlot>>,
    chain_id: String,
}

impl Drop for FlusherGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.flushers.lock() {
            map.remove(&self.chain_id);
        }
    }
}

impl CachedBlockStore {
    pub fn new(cache: Arc<dyn CacheTier>, durable: Arc<dyn BlockStore>) -> Self {
        Self {
            cache,
            durable,
            flushers: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheTier> {
        &self.cache
    }

    pub fn durable(&self) -> &Arc<dyn BlockStore> {
        &self.durable
    }

    /// Move up to `threshold` of the oldest cached blocks to the durable
    /// tier, provided at least `threshold` are cached. Returns the number
    /// of blocks moved.
    pub async fn flush_once(&self, chain_id: &str, threshold: u64) -> Result<usize, FeedError> {
        let threshold = threshold.max(1);
        if self.cache.count_blocks(chain_id).await? < threshold {
            return Ok(0);
        }

        let blocks = self
            .cache
            .get_earliest_blocks(chain_id, threshold as i64)
            .await?;
        if (blocks.len() as u64) < threshold {
            return Ok(0);
        }

        self.durable.put_blocks(chain_id, &blocks).await?;
        let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
        self.cache.delete_blocks(chain_id, &heights).await?;

        info!(
            chain_id,
            count = blocks.len(),
            from = heights.first().copied().unwrap_or_default(),
            to = heights.last().copied().unwrap_or_default(),
            "flushed cached blocks to durable storage"
        );
        Ok(blocks.len())
    }

    /// Flush until fewer than `threshold` blocks remain cached.
    async fn drain(&self, chain_id: &str, threshold: u64) -> Result<usize, FeedError> {
        let mut total = 0;
        loop {
            let moved = self.flush_once(chain_id, threshold).await?;
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    /// Run the cache → durable flusher for `chain_id` until `cancel` fires.
    ///
    /// Flushes immediately, then every `interval_ms` or whenever a write
    /// pushes the cache over `threshold`. A second flusher for the same
    /// chain is refused. Transient storage errors are logged and retried on
    /// the next tick.
    pub async fn start_flushing(
        &self,
        chain_id: &str,
        opts: FlushOptions,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        opts.validate()?;
        let wake = Arc::new(Notify::new());
        {
            let mut map = self
                .flushers
                .lock()
                .map_err(|e| FeedError::Storage(e.to_string()))?;
            if map.contains_key(chain_id) {
                return Err(FeedError::Aborted {
                    reason: format!("a block flusher is already running for '{chain_id}'"),
                });
            }
            map.insert(
                chain_id.to_string(),
                FlusherSlot {
                    threshold: opts.threshold,
                    wake: wake.clone(),
                },
            );
        }
        let _guard = FlusherGuard {
            flushers: &self.flushers,
            chain_id: chain_id.to_string(),
        };

        info!(
            chain_id,
            interval_ms = opts.interval_ms,
            threshold = opts.threshold,
            "block flusher started"
        );

        loop {
            match self.drain(chain_id, opts.threshold).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    warn!(chain_id, error = %e, "block flush failed, retrying next tick");
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(chain_id, "block flusher stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(opts.interval()) => {}
                _ = wake.notified() => {
                    debug!(chain_id, "block flusher woken by threshold");
                }
            }
        }
    }

    /// Wake the chain's flusher if the cache has grown past its threshold.
    async fn nudge_flusher(&self, chain_id: &str) -> Result<(), FeedError> {
        let slot = {
            let map = self
                .flushers
                .lock()
                .map_err(|e| FeedError::Storage(e.to_string()))?;
            map.get(chain_id).map(|s| (s.threshold, s.wake.clone()))
        };
        if let Some((threshold, wake)) = slot {
            if self.cache.count_blocks(chain_id).await? > threshold {
                wake.notify_one();
            }
        }
        Ok(())
    }
}

fn merge(parts: impl IntoIterator<Item = Vec<Block>>) -> BTreeMap<u64, Block> {
    let mut merged = BTreeMap::new();
    for part in parts {
        for block in part {
            merged.entry(block.height).or_insert(block);
        }
    }
    merged
}

#[async_trait]
impl BlockStore for CachedBlockStore {
    async fn init(&self, chain_id: &str) -> Result<(), FeedError> {
        self.cache.init(chain_id).await?;
        self.durable.init(chain_id).await
    }

    async fn put_blocks(&self, chain_id: &str, blocks: &[Block]) -> Result<(), FeedError> {
        self.cache.put_blocks(chain_id, blocks).await?;
        self.nudge_flusher(chain_id).await
    }

    async fn get_blocks(
        &self,
        chain_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<Block>, FeedError> {
        if start > end {
            return Ok(Vec::new());
        }
        let cached = self.cache.get_blocks(chain_id, start, end).await?;
        let durable_end = match cached.first() {
            Some(first) if first.height == start => return Ok(cached),
            Some(first) => first.height - 1,
            None => end,
        };
        let durable = self.durable.get_blocks(chain_id, start, durable_end).await?;
        Ok(merge([durable, cached]).into_values().collect())
    }

    async fn get_latest_block(&self, chain_id: &str) -> Result<Option<Block>, FeedError> {
        if let Some(block) = self.cache.get_latest_block(chain_id).await? {
            return Ok(Some(block));
        }
        self.durable.get_latest_block(chain_id).await
    }

    async fn get_latest_blocks(
        &self,
        chain_id: &str,
        limit: i64,
    ) -> Result<Vec<Block>, FeedError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let cached = self.cache.get_latest_blocks(chain_id, limit).await?;
        if cached.len() as i64 >= limit {
            return Ok(cached);
        }
        let durable = self.durable.get_latest_blocks(chain_id, limit).await?;
        Ok(merge([cached, durable])
            .into_values()
            .rev()
            .take(limit as usize)
            .collect())
    }

    async fn get_earliest_height(&self, chain_id: &str) -> Result<Option<u64>, FeedError> {
        let durable = self.durable.get_earliest_height(chain_id).await?;
        let cached = self.cache.get_earliest_height(chain_id).await?;
        Ok(match (durable, cached) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockStore;
    use std::time::Duration;

    fn blocks(range: std::ops::RangeInclusive<u64>) -> Vec<Block> {
        range.map(|h| Block::new(h, format!(r#"{{"number":{h}}}"#))).collect()
    }

    fn heights(blocks: &[Block]) -> Vec<u64> {
        blocks.iter().map(|b| b.height).collect()
    }

    fn two_tier() -> (Arc<MemoryBlockStore>, Arc<MemoryBlockStore>, Arc<CachedBlockStore>) {
        let cache = Arc::new(MemoryBlockStore::new());
        let durable = Arc::new(MemoryBlockStore::new());
        let store = Arc::new(CachedBlockStore::new(cache.clone(), durable.clone()));
        (cache, durable, store)
    }

    #[tokio::test]
    async fn writes_land_in_cache() {
        let (cache, durable, store) = two_tier();
        store.put_blocks("eth", &blocks(1..=3)).await.unwrap();
        assert_eq!(cache.count_blocks("eth").await.unwrap(), 3);
        assert!(durable.get_latest_block("eth").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flush_moves_oldest_blocks_only_at_threshold() {
        let (cache, durable, store) = two_tier();
        store.put_blocks("eth", &blocks(1..=4)).await.unwrap();
        assert_eq!(store.flush_once("eth", 5).await.unwrap(), 0);

        store.put_blocks("eth", &blocks(5..=7)).await.unwrap();
        assert_eq!(store.flush_once("eth", 5).await.unwrap(), 5);
        assert_eq!(heights(&durable.get_blocks("eth", 0, 100).await.unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(heights(&cache.get_blocks("eth", 0, 100).await.unwrap()), vec![6, 7]);
    }

    #[tokio::test]
    async fn reads_merge_both_tiers() {
        let (_, _, store) = two_tier();
        store.put_blocks("eth", &blocks(1..=10)).await.unwrap();
        store.flush_once("eth", 6).await.unwrap();

        assert_eq!(heights(&store.get_blocks("eth", 4, 8).await.unwrap()), vec![4, 5, 6, 7, 8]);
        assert_eq!(heights(&store.get_blocks("eth", 1, 3).await.unwrap()), vec![1, 2, 3]);
        assert_eq!(heights(&store.get_blocks("eth", 8, 20).await.unwrap()), vec![8, 9, 10]);
        assert!(store.get_blocks("eth", 5, 4).await.unwrap().is_empty());

        assert_eq!(heights(&store.get_latest_blocks("eth", 6).await.unwrap()), vec![10, 9, 8, 7, 6, 5]);
        assert!(store.get_latest_blocks("eth", 0).await.unwrap().is_empty());
        assert_eq!(store.get_latest_block("eth").await.unwrap().unwrap().height, 10);
        assert_eq!(store.get_earliest_height("eth").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn latest_falls_back_to_durable_when_cache_empty() {
        let (_, _, store) = two_tier();
        store.put_blocks("eth", &blocks(1..=3)).await.unwrap();
        store.flush_once("eth", 3).await.unwrap();
        assert_eq!(store.get_latest_block("eth").await.unwrap().unwrap().height, 3);
        assert_eq!(heights(&store.get_latest_blocks("eth", 2).await.unwrap()), vec![3, 2]);
    }

    #[tokio::test]
    async fn flusher_runs_on_start_and_is_exclusive() {
        let (cache, durable, store) = two_tier();
        store.put_blocks("eth", &blocks(1..=4)).await.unwrap();

        let cancel = CancellationToken::new();
        let opts = FlushOptions { interval_ms: 60_000, threshold: 2 };
        let runner = {
            let store = store.clone();
            let cancel = cancel.clone();
            let opts = opts.clone();
            tokio::spawn(async move { store.start_flushing("eth", opts, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.count_blocks("eth").await.unwrap(), 0);
        assert_eq!(durable.count_blocks("eth").await.unwrap(), 4);

        let second = store.start_flushing("eth", opts, cancel.clone()).await;
        assert!(matches!(second, Err(FeedError::Aborted { .. })));

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flusher_wakes_when_threshold_exceeded() {
        let (cache, durable, store) = two_tier();
        let cancel = CancellationToken::new();
        let runner = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                store
                    .start_flushing("eth", FlushOptions { interval_ms: 60_000, threshold: 3 }, cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.put_blocks("eth", &blocks(1..=4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(heights(&durable.get_blocks("eth", 0, 10).await.unwrap()), vec![1, 2, 3]);
        assert_eq!(cache.count_blocks("eth").await.unwrap(), 1);

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }
}
