//! Block storage traits.
//!
//! [`BlockStore`] is what the pipeline reads and writes. [`CacheTier`] adds
//! the extra operations the cache→durable flusher needs from a hot tier.

use async_trait::async_trait;

use crate::error::FeedError;
use crate::types::Block;

/// Per-chain block storage keyed by height.
///
/// Implementations include `MemoryBlockStore`, `SqliteBlockStore`,
/// `PostgresBlockStore`, and the two-tier `CachedBlockStore`.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Prepare storage for `chain_id`. Safe to call repeatedly.
    async fn init(&self, chain_id: &str) -> Result<(), FeedError>;

    /// Store `blocks`. Writing a height that already exists is not an error
    /// and never produces a second copy.
    async fn put_blocks(&self, chain_id: &str, blocks: &[Block]) -> Result<(), FeedError>;

    /// Blocks with `start <= height <= end`, ascending. Empty if `start > end`.
    async fn get_blocks(&self, chain_id: &str, start: u64, end: u64)
        -> Result<Vec<Block>, FeedError>;

    async fn get_latest_block(&self, chain_id: &str) -> Result<Option<Block>, FeedError>;

    /// Up to `limit` newest blocks, newest first. Empty if `limit <= 0`.
    async fn get_latest_blocks(&self, chain_id: &str, limit: i64)
        -> Result<Vec<Block>, FeedError>;

    /// Lowest height still retained for `chain_id`.
    async fn get_earliest_height(&self, chain_id: &str) -> Result<Option<u64>, FeedError>;
}

/// A bounded hot tier that can hand its oldest entries to a durable tier.
#[async_trait]
pub trait CacheTier: BlockStore {
    /// Up to `limit` oldest blocks, oldest first. Empty if `limit <= 0`.
    async fn get_earliest_blocks(&self, chain_id: &str, limit: i64)
        -> Result<Vec<Block>, FeedError>;

    async fn delete_blocks(&self, chain_id: &str, heights: &[u64]) -> Result<(), FeedError>;

    async fn count_blocks(&self, chain_id: &str) -> Result<u64, FeedError>;
}
