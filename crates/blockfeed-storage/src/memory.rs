//! In-memory block tier.
//!
//! One ordered map per chain, keyed by height. Writes never replace an
//! existing height. Used as the cache tier of a single-process deployment and
//! throughout the tests. All data is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use blockfeed_core::error::FeedError;
use blockfeed_core::store::{BlockStore, CacheTier};
use blockfeed_core::types::Block;

#[derive(Default)]
pub struct MemoryBlockStore {
    chains: Mutex<HashMap<String, BTreeMap<u64, Block>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, BTreeMap<u64, Block>>>, FeedError> {
        self.chains
            .lock()
            .map_err(|e| FeedError::Storage(e.to_string()))
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn init(&self, chain_id: &str) -> Result<(), FeedError> {
        self.lock()?.entry(chain_id.to_string()).or_default();
        Ok(())
    }

    async fn put_blocks(&self, chain_id: &str, blocks: &[Block]) -> Result<(), FeedError> {
        let mut chains = self.lock()?;
        let chain = chains.entry(chain_id.to_string()).or_default();
        for block in blocks {
            chain.entry(block.height).or_insert_with(|| block.clone());
        }
        Ok(())
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
        let chains = self.lock()?;
        Ok(chains
            .get(chain_id)
            .map(|chain| chain.range(start..=end).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_latest_block(&self, chain_id: &str) -> Result<Option<Block>, FeedError> {
        let chains = self.lock()?;
        Ok(chains
            .get(chain_id)
            .and_then(|chain| chain.values().next_back().cloned()))
    }

    async fn get_latest_blocks(
        &self,
        chain_id: &str,
        limit: i64,
    ) -> Result<Vec<Block>, FeedError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let chains = self.lock()?;
        Ok(chains
            .get(chain_id)
            .map(|chain| chain.values().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_earliest_height(&self, chain_id: &str) -> Result<Option<u64>, FeedError> {
        let chains = self.lock()?;
        Ok(chains
            .get(chain_id)
            .and_then(|chain| chain.keys().next().copied()))
    }
}

#[async_trait]
impl CacheTier for MemoryBlockStore {
    async fn get_earliest_blocks(
        &self,
        chain_id: &str,
        limit: i64,
    ) -> Result<Vec<Block>, FeedError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let chains = self.lock()?;
        Ok(chains
            .get(chain_id)
            .map(|chain| chain.values().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_blocks(&self, chain_id: &str, heights: &[u64]) -> Result<(), FeedError> {
        let mut chains = self.lock()?;
        if let Some(chain) = chains.get_mut(chain_id) {
            for height in heights {
                chain.remove(height);
            }
        }
        Ok(())
    }

    async fn count_blocks(&self, chain_id: &str) -> Result<u64, FeedError> {
        let chains = self.lock()?;
        Ok(chains.get(chain_id).map(|c| c.len() as u64).unwrap_or(0))
    }
}
