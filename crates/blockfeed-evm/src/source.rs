//! Head-polling block source.
//!
//! With a start height the source first walks from it to the head it sees on
//! the first poll, then keeps following. Every height is emitted exactly once
//! and in order, even when the head jumps several blocks between polls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use blockfeed_core::error::FeedError;
use blockfeed_core::source::{BlockSink, BlockSource};

use crate::client::EvmRpcClient;
use crate::payload::canonical_payload;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOptions {
    /// Time between `eth_blockNumber` polls once caught up.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Blocks to stay behind the node's head.
    #[serde(default)]
    pub confirmation_depth: u64,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            confirmation_depth: 0,
        }
    }
}

pub struct EvmBlockSource<C> {
    chain_id: String,
    client: C,
    opts: SourceOptions,
}

impl<C: EvmRpcClient> EvmBlockSource<C> {
    pub fn new(chain_id: impl Into<String>, client: C, opts: SourceOptions) -> Self {
        Self {
            chain_id: chain_id.into(),
            client,
            opts,
        }
    }

    async fn confirmed_head(&self) -> Result<u64, FeedError> {
        let head = self.client.block_number().await?;
        Ok(head.saturating_sub(self.opts.confirmation_depth))
    }

    /// Emit `from..=to`. Returns the next height still to emit.
    async fn walk(
        &self,
        from: u64,
        to: u64,
        sink: &dyn BlockSink,
        cancel: &CancellationToken,
    ) -> Result<u64, FeedError> {
        let mut next = from;
        while next <= to && !cancel.is_cancelled() {
            let Some(raw) = self.client.block_by_number(next).await? else {
                // Head reported by a load-balanced node the serving node lacks.
                debug!(chain = %self.chain_id, height = next, "block not available yet");
                break;
            };
            let block = canonical_payload(&raw)?;
            if block.height != next {
                return Err(FeedError::Rpc(format!(
                    "asked for block {next}, node returned {}",
                    block.height
                )));
            }
            sink.handle_block(block).await?;
            next += 1;
        }
        Ok(next)
    }
}

#[async_trait]
impl<C: EvmRpcClient> BlockSource for EvmBlockSource<C> {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn subscribe(
        &self,
        start_height: Option<u64>,
        sink: &dyn BlockSink,
        cancel: &CancellationToken,
    ) -> Result<(), FeedError> {
        let poll = Duration::from_millis(self.opts.poll_interval_ms);
        let head = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            head = self.confirmed_head() => head?,
        };
        let mut next = start_height.unwrap_or(head);
        if next < head {
            info!(chain = %self.chain_id, from = next, to = head, "catching up to head");
        }

        let mut target = head;
        loop {
            next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = self.walk(next, target, sink, cancel) => next?,
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }
            target = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                head = self.confirmed_head() => head?,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use blockfeed_core::types::Block;

    use super::*;

    /// Chain whose head advances by `step` on every `eth_blockNumber` call.
    struct FakeChain {
        head: AtomicU64,
        step: u64,
        missing: Mutex<BTreeMap<u64, u32>>,
    }

    impl FakeChain {
        fn new(head: u64, step: u64) -> Self {
            Self {
                head: AtomicU64::new(head),
                step,
                missing: Mutex::new(BTreeMap::new()),
            }
        }
    }

    #[async_trait]
    impl EvmRpcClient for Arc<FakeChain> {
        async fn block_number(&self) -> Result<u64, FeedError> {
            Ok(self.head.fetch_add(self.step, Ordering::SeqCst))
        }

        async fn block_by_number(&self, number: u64) -> Result<Option<Value>, FeedError> {
            let mut missing = self.missing.lock().unwrap();
            if let Some(left) = missing.get_mut(&number) {
                if *left > 0 {
                    *left -= 1;
                    return Ok(None);
                }
            }
            Ok(Some(json!({ "number": format!("0x{number:x}"), "hash": format!("0x{number}") })))
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Block>>);

    #[async_trait]
    impl BlockSink for Collect {
        async fn handle_block(&self, block: Block) -> Result<(), FeedError> {
            self.0.lock().unwrap().push(block);
            Ok(())
        }
    }

    fn opts() -> SourceOptions {
        SourceOptions { poll_interval_ms: 5, confirmation_depth: 0 }
    }

    async fn run(source: &EvmBlockSource<Arc<FakeChain>>, start: Option<u64>, until: usize) -> Vec<u64> {
        let sink = Collect::default();
        let cancel = CancellationToken::new();
        let watch = async {
            while sink.0.lock().unwrap().len() < until {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            cancel.cancel();
        };
        let (res, _) = tokio::join!(source.subscribe(start, &sink, &cancel), watch);
        res.unwrap();
        let heights: Vec<u64> = sink.0.lock().unwrap().iter().map(|b| b.height).collect();
        heights
    }

    #[tokio::test]
    async fn catches_up_then_follows_without_gaps() {
        let chain = Arc::new(FakeChain::new(10, 3));
        let source = EvmBlockSource::new("eth", chain, opts());
        let heights = run(&source, Some(4), 15).await;
        assert_eq!(heights[..15], (4..19).collect::<Vec<_>>()[..]);
    }

    #[tokio::test]
    async fn no_start_height_begins_at_head() {
        let chain = Arc::new(FakeChain::new(100, 1));
        let source = EvmBlockSource::new("eth", chain, opts());
        let heights = run(&source, None, 3).await;
        assert_eq!(heights[..3], [100, 101, 102]);
    }

    #[tokio::test]
    async fn unavailable_block_is_retried_next_poll() {
        let chain = Arc::new(FakeChain::new(5, 1));
        chain.missing.lock().unwrap().insert(6, 2);
        let source = EvmBlockSource::new("eth", chain, opts());
        let heights = run(&source, Some(5), 4).await;
        assert_eq!(heights[..4], [5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn confirmation_depth_holds_back() {
        let chain = Arc::new(FakeChain::new(20, 0));
        let source = EvmBlockSource::new(
            "eth",
            chain,
            SourceOptions { poll_interval_ms: 5, confirmation_depth: 5 },
        );
        let sink = Collect::default();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            stop.cancel();
        });
        source.subscribe(Some(10), &sink, &cancel).await.unwrap();
        let heights: Vec<u64> = sink.0.lock().unwrap().iter().map(|b| b.height).collect();
        assert_eq!(heights, (10..=15).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cancelled_before_start_returns_ok() {
        let source = EvmBlockSource::new("eth", Arc::new(FakeChain::new(1, 1)), opts());
        let cancel = CancellationToken::new();
        cancel.cancel();
        source.subscribe(None, &Collect::default(), &cancel).await.unwrap();
    }
}
