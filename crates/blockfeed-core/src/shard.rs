//! Shard routing and per-shard key naming.
//!
//! Each shard owns its own pending set, delivery log and flushed-height
//! cursor. Sharding partitions webhooks, not blocks: ingestion flushes every
//! shard with the same height.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FeedError;

/// Consumer group every delivery processor joins on a shard's delivery log.
pub const DELIVERY_GROUP: &str = "webhook-processors";

/// Zero-based shard index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl ShardId {
    /// Namespaced key for a piece of this shard's state.
    pub fn key(&self, name: &str) -> String {
        format!("block-feed:{{s{}}}:{name}", self.0)
    }

    /// Topic carrying this shard's delivery messages.
    pub fn delivery_topic(&self) -> String {
        self.key("webhook-stream")
    }

    /// Latest-only topic used to signal new chain heights to this shard.
    pub fn flush_topic(&self) -> String {
        self.key("flush-notifications")
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Maps webhook ids onto `shard_count` shards with a stable hash.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    pub fn new(shard_count: u32) -> Result<Self, FeedError> {
        if shard_count == 0 {
            return Err(FeedError::Config("shard_count must be at least 1".into()));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard a webhook lives on. Identical across processes and restarts.
    pub fn shard_for(&self, webhook_id: &str) -> ShardId {
        let digest = Sha256::digest(webhook_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        ShardId((u64::from_be_bytes(prefix) % u64::from(self.shard_count)) as u32)
    }

    /// Validate an externally assigned shard number.
    pub fn assigned(&self, index: u32) -> Result<ShardId, FeedError> {
        if index >= self.shard_count {
            return Err(FeedError::Config(format!(
                "shard {index} out of range (shard_count = {})",
                self.shard_count
            )));
        }
        Ok(ShardId(index))
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.shard_count).map(ShardId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_shards_rejected() {
        assert!(ShardRouter::new(0).is_err());
    }

    #[test]
    fn routing_is_stable_and_in_range() {
        let router = ShardRouter::new(4).unwrap();
        for i in 0..200 {
            let id = format!("webhook-{i}");
            let shard = router.shard_for(&id);
            assert!(shard.0 < 4);
            assert_eq!(shard, router.shard_for(&id));
        }
    }

    #[test]
    fn routing_spreads_webhooks() {
        let router = ShardRouter::new(4).unwrap();
        let mut seen = [0u32; 4];
        for i in 0..400 {
            seen[router.shard_for(&format!("webhook-{i}")).0 as usize] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0), "{seen:?}");
    }

    #[test]
    fn single_shard_takes_everything() {
        let router = ShardRouter::new(1).unwrap();
        assert_eq!(router.shard_for("anything"), ShardId(0));
        assert_eq!(router.shards().count(), 1);
    }

    #[test]
    fn assigned_shard_bounds() {
        let router = ShardRouter::new(2).unwrap();
        assert_eq!(router.assigned(1).unwrap(), ShardId(1));
        assert!(router.assigned(2).is_err());
    }

    #[test]
    fn keys_are_namespaced_per_shard() {
        assert_eq!(ShardId(3).key("pending-set"), "block-feed:{s3}:pending-set");
        assert_eq!(ShardId(0).delivery_topic(), "block-feed:{s0}:webhook-stream");
        assert_ne!(ShardId(0).flush_topic(), ShardId(1).flush_topic());
    }
}
