//! Records that travel between pipeline stages.

use serde::{Deserialize, Serialize};

/// A chain block as stored and delivered: its height plus a canonical JSON
/// projection of the raw node response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    /// Canonical JSON text (stable key order).
    pub payload: String,
}

impl Block {
    pub fn new(height: u64, payload: impl Into<String>) -> Self {
        Self {
            height,
            payload: payload.into(),
        }
    }
}

/// A unit of work on a shard's delivery log.
///
/// `is_new = true` asks for the most recent `max_blocks` blocks of the
/// webhook's chain; otherwise the inclusive range
/// `[block_height, block_height + max_blocks - 1]` is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMessage {
    pub webhook_id: String,
    pub block_height: u64,
    pub is_new: bool,
}

impl DeliveryMessage {
    /// The first job of a freshly registered webhook.
    pub fn initial(webhook_id: impl Into<String>) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            block_height: 0,
            is_new: true,
        }
    }

    /// A job covering blocks from `block_height` onwards.
    pub fn at(webhook_id: impl Into<String>, block_height: u64) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            block_height,
            is_new: false,
        }
    }

    /// Last height (inclusive) of the range this job asks for.
    pub fn range_end(&self, max_blocks: u32) -> u64 {
        self.block_height
            .saturating_add(u64::from(max_blocks.max(1)))
            .saturating_sub(1)
    }

    /// Pending-set score for this job once it goes back to waiting: the last
    /// height the webhook has already seen. New webhooks wait at zero.
    pub fn pending_score(&self) -> u64 {
        if self.is_new {
            0
        } else {
            self.block_height.saturating_sub(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_end_is_inclusive() {
        let msg = DeliveryMessage::at("w1", 10);
        assert_eq!(msg.range_end(1), 10);
        assert_eq!(msg.range_end(5), 14);
        // A zero-sized window still covers the requested height.
        assert_eq!(msg.range_end(0), 10);
    }

    #[test]
    fn pending_score_tracks_last_seen_height() {
        assert_eq!(DeliveryMessage::initial("w1").pending_score(), 0);
        assert_eq!(DeliveryMessage::at("w1", 4).pending_score(), 3);
        assert_eq!(DeliveryMessage::at("w1", 0).pending_score(), 0);
    }

    #[test]
    fn wire_shape_uses_camel_case() {
        let json = serde_json::to_string(&DeliveryMessage::initial("w1")).unwrap();
        assert_eq!(json, r#"{"webhookId":"w1","blockHeight":0,"isNew":true}"#);
    }
}
