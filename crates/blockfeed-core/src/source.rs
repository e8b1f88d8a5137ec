//! The block-source capability: one implementation per chain family.
//!
//! A source follows a chain node and pushes every block, in strictly
//! increasing height order, into a [`BlockSink`]. Chain-specific payload
//! formatting stays behind this boundary.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::types::Block;

/// Receives blocks from a [`BlockSource`]. An error aborts the subscription.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn handle_block(&self, block: Block) -> Result<(), FeedError>;
}

#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Chain slug this source reads from.
    fn chain_id(&self) -> &str;

    /// Follow the chain until `cancel` fires or an error occurs.
    ///
    /// With `start_height = Some(h)` the source first walks every height from
    /// `h` up to the current head, once, before following new heads. With
    /// `None` it starts at the current head. Cancellation returns `Ok(())`.
    async fn subscribe(
        &self,
        start_height: Option<u64>,
        sink: &dyn BlockSink,
        cancel: &CancellationToken,
    ) -> Result<(), FeedError>;
}

// ─── Static source (for testing) ─────────────────────────────────────────────

/// Replays a fixed list of blocks, then idles until cancelled.
pub struct StaticBlockSource {
    chain_id: String,
    blocks: Vec<Block>,
}

impl StaticBlockSource {
    pub fn new(chain_id: impl Into<String>, mut blocks: Vec<Block>) -> Self {
        blocks.sort_by_key(|b| b.height);
        Self {
            chain_id: chain_id.into(),
            blocks,
        }
    }
}

#[async_trait]
impl BlockSource for StaticBlockSource {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn subscribe(
        &self,
        start_height: Option<u64>,
        sink: &dyn BlockSink,
        cancel: &CancellationToken,
    ) -> Result<(), FeedError> {
        let from = start_height.unwrap_or(0);
        for block in self.blocks.iter().filter(|b| b.height >= from) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            sink.handle_block(block.clone()).await?;
        }
        cancel.cancelled().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<u64>>);

    #[async_trait]
    impl BlockSink for Collect {
        async fn handle_block(&self, block: Block) -> Result<(), FeedError> {
            self.0.lock().unwrap().push(block.height);
            if block.height == 99 {
                return Err(FeedError::Other("boom".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn static_source_resumes_from_start_height() {
        let source = StaticBlockSource::new(
            "test",
            vec![Block::new(3, "{}"), Block::new(1, "{}"), Block::new(2, "{}")],
        );
        let sink = Collect::default();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop.cancel();
        });
        source.subscribe(Some(2), &sink, &cancel).await.unwrap();
        assert_eq!(*sink.0.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn sink_error_aborts_subscription() {
        let source = StaticBlockSource::new("test", vec![Block::new(99, "{}")]);
        let sink = Collect::default();
        let err = source
            .subscribe(None, &sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Other(_)));
    }
}
