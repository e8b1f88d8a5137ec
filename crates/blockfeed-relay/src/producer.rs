//! Publishes a chain's blocks onto its ingestion log.
//!
//! One producer runs per chain. When the source fails with a transient error
//! the producer re-subscribes after an exponential backoff with jitter,
//! resuming after the last block it published. The attempt counter resets
//! whenever a subscription made progress.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use blockfeed_core::error::FeedError;
use blockfeed_core::retry::{RetryConfig, RetryPolicy};
use blockfeed_core::source::{BlockSink, BlockSource};
use blockfeed_core::store::BlockStore;
use blockfeed_core::types::Block;
use blockfeed_stream::{LogBackend, Stream};

/// Consumer group of the ingestion log.
pub const BLOCK_GROUP: &str = "block-consumers";

/// Ingestion log topic for `chain_id`.
pub fn block_topic(chain_id: &str) -> String {
    format!("block-feed:{{{chain_id}}}:block-stream")
}

/// Typed handle on `chain_id`'s ingestion log.
pub fn block_log(backend: Arc<dyn LogBackend>, chain_id: &str) -> Stream<Block> {
    Stream::new(backend, block_topic(chain_id), BLOCK_GROUP)
}

pub struct BlockProducer<S> {
    source: S,
    log: Stream<Block>,
    store: Arc<dyn BlockStore>,
    retry: RetryPolicy,
}

impl<S: BlockSource> BlockProducer<S> {
    pub fn new(source: S, log: Stream<Block>, store: Arc<dyn BlockStore>) -> Self {
        Self {
            source,
            log,
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    /// Follow the source until cancelled.
    ///
    /// Without an explicit `start_height` the producer resumes at the block
    /// store's newest height, republishing it; ingestion is idempotent.
    pub async fn run(
        &self,
        start_height: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let chain_id = self.source.chain_id().to_string();
        let mut next = match start_height {
            Some(h) => Some(h),
            None => self
                .store
                .get_latest_block(&chain_id)
                .await?
                .map(|b| b.height),
        };
        info!(chain_id = %chain_id, start_height = ?next, topic = %self.log.topic(), "block producer started");

        let mut attempt = 0u32;
        loop {
            let sink = PublishSink {
                log: &self.log,
                last: Mutex::new(None),
            };
            let result = self.source.subscribe(next, &sink, &cancel).await;

            if let Some(h) = sink.last_published()? {
                next = Some(h + 1);
                attempt = 0;
            }

            let err = match result {
                Ok(()) => {
                    info!(chain_id = %chain_id, "block producer stopped");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    error!(chain_id = %chain_id, error = %e, "block source failed");
                    return Err(e);
                }
                Err(e) => e,
            };

            attempt += 1;
            let Some(delay) = self.retry.next_delay(attempt) else {
                error!(chain_id = %chain_id, attempts = attempt, error = %err, "giving up on block source");
                return Err(FeedError::RetriesExhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            };
            warn!(
                chain_id = %chain_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                resume_at = ?next,
                error = %err,
                "block source failed, reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Appends each block to the log, dropping anything at or below the last
/// height it published.
struct PublishSink<'a> {
    log: &'a Stream<Block>,
    last: Mutex<Option<u64>>,
}

impl PublishSink<'_> {
    fn last_published(&self) -> Result<Option<u64>, FeedError> {
        self.last
            .lock()
            .map(|g| *g)
            .map_err(|e| FeedError::Other(e.to_string()))
    }
}

#[async_trait]
impl BlockSink for PublishSink<'_> {
    async fn handle_block(&self, block: Block) -> Result<(), FeedError> {
        if let Some(last) = self.last_published()? {
            if block.height <= last {
                debug!(height = block.height, last, "skipping already published block");
                return Ok(());
            }
        }
        let id = self.log.publish(&block).await?;
        debug!(height = block.height, message_id = %id, "block published");
        *self
            .last
            .lock()
            .map_err(|e| FeedError::Other(e.to_string()))? = Some(block.height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use blockfeed_storage::MemoryBlockStore;
    use blockfeed_stream::MemoryLog;

    use super::*;

    /// Emits heights from the requested start and fails after `fail_after`
    /// blocks on each of its first `failures` subscriptions.
    struct FlakySource {
        head: u64,
        fail_after: u64,
        failures: u32,
        calls: AtomicU32,
        starts: Mutex<Vec<Option<u64>>>,
        retryable: bool,
    }

    impl FlakySource {
        fn new(head: u64, fail_after: u64, failures: u32) -> Self {
            Self {
                head,
                fail_after,
                failures,
                calls: AtomicU32::new(0),
                starts: Mutex::new(Vec::new()),
                retryable: true,
            }
        }
    }

    #[async_trait]
    impl BlockSource for FlakySource {
        fn chain_id(&self) -> &str {
            "eth"
        }

        async fn subscribe(
            &self,
            start_height: Option<u64>,
            sink: &dyn BlockSink,
            cancel: &CancellationToken,
        ) -> Result<(), FeedError> {
            self.starts.lock().unwrap().push(start_height);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let from = start_height.unwrap_or(self.head);
            for (n, h) in (from..=self.head).enumerate() {
                if call < self.failures && n as u64 == self.fail_after {
                    return Err(if self.retryable {
                        FeedError::Rpc("connection reset".into())
                    } else {
                        FeedError::Config("bad endpoint".into())
                    });
                }
                sink.handle_block(Block::new(h, format!("{{\"n\":{h}}}"))).await?;
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            jitter_ms: 1,
        }
    }

    async fn published(log: &Stream<Block>) -> Vec<u64> {
        let backend = log.backend();
        backend.create_group(log.topic(), "inspect").await.unwrap();
        backend
            .read_new(log.topic(), "inspect", "c", 1_000)
            .await
            .unwrap()
            .into_iter()
            .map(|m| serde_json::from_str::<Block>(&m.payload).unwrap().height)
            .collect()
    }

    async fn run_until(producer: &BlockProducer<FlakySource>, start: Option<u64>, ms: u64) -> Result<(), FeedError> {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            stop.cancel();
        });
        producer.run(start, cancel).await
    }

    #[tokio::test]
    async fn resumes_after_last_published_block() {
        let log = block_log(Arc::new(MemoryLog::new()), "eth");
        let producer = BlockProducer::new(
            FlakySource::new(6, 2, 2),
            log.clone(),
            Arc::new(MemoryBlockStore::new()),
        )
        .with_retry(fast_retry(3));

        run_until(&producer, Some(1), 100).await.unwrap();
        assert_eq!(published(&log).await, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(
            *producer.source.starts.lock().unwrap(),
            vec![Some(1), Some(3), Some(5)]
        );
    }

    #[tokio::test]
    async fn defaults_to_latest_stored_height() {
        let store = Arc::new(MemoryBlockStore::new());
        store
            .put_blocks("eth", &[Block::new(4, "{}"), Block::new(5, "{}")])
            .await
            .unwrap();
        let log = block_log(Arc::new(MemoryLog::new()), "eth");
        let producer = BlockProducer::new(FlakySource::new(7, 0, 0), log.clone(), store);

        run_until(&producer, None, 50).await.unwrap();
        assert_eq!(published(&log).await, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let log = block_log(Arc::new(MemoryLog::new()), "eth");
        let producer = BlockProducer::new(
            FlakySource::new(6, 0, u32::MAX),
            log,
            Arc::new(MemoryBlockStore::new()),
        )
        .with_retry(fast_retry(2));

        let err = run_until(&producer, Some(1), 2_000).await.unwrap_err();
        assert!(matches!(err, FeedError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let mut source = FlakySource::new(6, 0, 1);
        source.retryable = false;
        let producer = BlockProducer::new(
            source,
            block_log(Arc::new(MemoryLog::new()), "eth"),
            Arc::new(MemoryBlockStore::new()),
        );
        let err = run_until(&producer, Some(1), 2_000).await.unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
        assert_eq!(producer.source.calls.load(Ordering::SeqCst), 1);
    }
}
