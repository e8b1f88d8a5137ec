//! Backend traits for the append log and the shard scheduler.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use blockfeed_core::error::FeedError;
use blockfeed_core::shard::ShardId;
use blockfeed_core::types::DeliveryMessage;
use blockfeed_core::webhook::Webhook;

/// Insertion-assigned, monotonically increasing message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raw log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub id: MessageId,
    pub payload: String,
}

/// Bookkeeping for a message delivered to a consumer but not yet acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: MessageId,
    pub consumer: String,
    /// Times the message has been handed out, the current delivery included.
    pub deliveries: u32,
    pub last_delivered_ms: i64,
}

impl PendingEntry {
    /// Redeliveries so far: zero on first delivery.
    pub fn retry_count(&self) -> u32 {
        self.deliveries.saturating_sub(1)
    }
}

/// A webhook waiting in a shard's pending set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub webhook_id: String,
    /// Last height the webhook has seen.
    pub score: u64,
    /// Message appended to the delivery log on promotion.
    pub message: DeliveryMessage,
}

/// How a processed delivery message hands its webhook back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RearmMode {
    /// Straight onto the delivery log if its blocks were already flushed,
    /// otherwise into the pending set.
    Schedule,
    /// Always into the pending set, to wait for the next flush.
    Wait,
}

/// Where a re-armed webhook ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    Pending { score: u64 },
    Promoted(MessageId),
}

/// Ordered topics with consumer groups, per-consumer pending records and
/// delivery counters.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Create `group` on `topic` reading from the start. No-op if it exists.
    async fn create_group(&self, topic: &str, group: &str) -> Result<(), FeedError>;

    /// Append a message. With `max_len`, the oldest entries beyond that
    /// length are trimmed.
    async fn append(
        &self,
        topic: &str,
        payload: &str,
        max_len: Option<usize>,
    ) -> Result<MessageId, FeedError>;

    /// Claim up to `count` messages past the group cursor for `consumer`.
    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogMessage>, FeedError>;

    /// Re-deliver up to `count` of `consumer`'s own pending messages with ids
    /// greater than `after`, bumping their delivery counters. Pending records
    /// whose message no longer exists are discarded.
    async fn read_backlog(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: MessageId,
        count: usize,
    ) -> Result<Vec<LogMessage>, FeedError>;

    async fn pending_entry(
        &self,
        topic: &str,
        group: &str,
        id: MessageId,
    ) -> Result<Option<PendingEntry>, FeedError>;

    /// Acknowledge and delete `ids`, appending `replacement` in the same step.
    async fn ack_del(
        &self,
        topic: &str,
        group: &str,
        ids: &[MessageId],
        replacement: Option<&str>,
    ) -> Result<Option<MessageId>, FeedError>;

    async fn topic_len(&self, topic: &str) -> Result<u64, FeedError>;

    /// Wait until something may have been appended to `topic`, or `timeout`.
    async fn wait_for_messages(&self, topic: &str, timeout: Duration) {
        let _ = topic;
        tokio::time::sleep(timeout.min(Duration::from_millis(100))).await;
    }
}

/// Atomic scheduling operations over a shard's webhook definitions, pending
/// set, flushed-height cursor and delivery log.
#[async_trait]
pub trait ScheduleBackend: Send + Sync {
    /// Store `webhook`. When it was not yet known, also put it in the pending
    /// set at score 0 with its initial job. Returns `true` if new.
    async fn set_webhook(&self, shard: ShardId, webhook: &Webhook) -> Result<bool, FeedError>;

    async fn get_webhook(&self, shard: ShardId, id: &str) -> Result<Option<Webhook>, FeedError>;

    /// Remove the definition and any pending job. Returns `true` if it existed.
    async fn delete_webhook(&self, shard: ShardId, id: &str) -> Result<bool, FeedError>;

    /// Record `latest_height` and promote every pending job whose score is
    /// below it onto the delivery log. Returns the promoted jobs.
    async fn flush_pending(
        &self,
        shard: ShardId,
        latest_height: u64,
    ) -> Result<Vec<PendingJob>, FeedError>;

    /// Ack and delete `id` on the delivery log and schedule `next` in the
    /// same step.
    async fn ack_and_rearm(
        &self,
        shard: ShardId,
        group: &str,
        id: MessageId,
        next: &DeliveryMessage,
        mode: RearmMode,
    ) -> Result<Rearm, FeedError>;

    async fn latest_flushed_height(&self, shard: ShardId) -> Result<Option<u64>, FeedError>;

    /// Pending jobs ordered by score.
    async fn pending_jobs(&self, shard: ShardId) -> Result<Vec<PendingJob>, FeedError>;
}

/// Decide where a re-armed job goes given the shard's flushed height.
pub(crate) fn rearm_target(
    next: &DeliveryMessage,
    latest_flushed: Option<u64>,
    mode: RearmMode,
) -> Option<u64> {
    let score = next.pending_score();
    match (mode, latest_flushed) {
        (RearmMode::Schedule, Some(latest)) if !next.is_new && next.block_height <= latest => None,
        _ => Some(score),
    }
}

/// Select the jobs a flush at `latest_height` promotes from a score-ordered
/// pending set.
pub(crate) fn promotable(jobs: &[(u64, String)], latest_height: u64) -> usize {
    match jobs.last() {
        // Every member is behind: take the whole set without scanning.
        Some((max, _)) if *max < latest_height => jobs.len(),
        _ => jobs
            .iter()
            .take_while(|(score, _)| *score < latest_height)
            .count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(scores: &[u64]) -> Vec<(u64, String)> {
        scores.iter().map(|s| (*s, format!("w{s}"))).collect()
    }

    #[test]
    fn promotion_prefix() {
        assert_eq!(promotable(&set(&[3, 5, 9]), 7), 2);
        assert_eq!(promotable(&set(&[3, 5, 9]), 10), 3);
        assert_eq!(promotable(&set(&[3, 5, 9]), 3), 0);
        assert_eq!(promotable(&set(&[]), 10), 0);
    }

    #[test]
    fn rearm_goes_straight_to_log_when_already_flushed() {
        let next = DeliveryMessage::at("w1", 4);
        assert_eq!(rearm_target(&next, Some(5), RearmMode::Schedule), None);
        assert_eq!(rearm_target(&next, Some(4), RearmMode::Schedule), None);
        assert_eq!(rearm_target(&next, Some(3), RearmMode::Schedule), Some(3));
        assert_eq!(rearm_target(&next, None, RearmMode::Schedule), Some(3));
        assert_eq!(rearm_target(&next, Some(9), RearmMode::Wait), Some(3));
    }

    #[test]
    fn new_jobs_always_wait() {
        let next = DeliveryMessage::initial("w1");
        assert_eq!(rearm_target(&next, Some(9), RearmMode::Schedule), Some(0));
    }

    #[test]
    fn retry_count_excludes_first_delivery() {
        let entry = PendingEntry {
            id: MessageId(1),
            consumer: "c-0".into(),
            deliveries: 1,
            last_delivered_ms: 0,
        };
        assert_eq!(entry.retry_count(), 0);
        assert_eq!(PendingEntry { deliveries: 4, ..entry }.retry_count(), 3);
    }
}
