//! End-to-end runs of producer → ingestion → scheduler → delivery over the
//! in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

use blockfeed_core::config::SubscribeOptions;
use blockfeed_core::error::FeedError;
use blockfeed_core::shard::ShardRouter;
use blockfeed_core::source::StaticBlockSource;
use blockfeed_core::store::BlockStore;
use blockfeed_core::types::{Block, DeliveryMessage};
use blockfeed_core::webhook::Webhook;
use blockfeed_relay::{block_log, BlockProducer, IngestionConsumer, WebhookClient, WebhookProcessor};
use blockfeed_storage::MemoryBlockStore;
use blockfeed_stream::{MemoryLog, ShardSet, Stream};

const CHAIN: &str = "eth";

fn fast(concurrency: usize, batch_size: usize) -> SubscribeOptions {
    SubscribeOptions {
        batch_size,
        concurrency,
        block_timeout_ms: 20,
    }
}

fn block(h: u64) -> Block {
    Block::new(h, format!("{{\"number\":{h}}}"))
}

struct Pipeline {
    server: MockServer,
    store: Arc<MemoryBlockStore>,
    shards: ShardSet,
    blocks: Stream<Block>,
    cancel: CancellationToken,
    tasks: JoinSet<Result<(), FeedError>>,
}

impl Pipeline {
    async fn new(status: u16) -> Self {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let backend = Arc::new(MemoryLog::new());
        Self {
            server,
            store: Arc::new(MemoryBlockStore::new()),
            shards: ShardSet::new(backend.clone(), CHAIN, ShardRouter::new(2).unwrap()),
            blocks: block_log(backend, CHAIN),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Start ingestion plus one processor pool per shard.
    fn spawn_roles(&mut self) {
        let ingest = Arc::new(IngestionConsumer::new(
            CHAIN,
            self.blocks.clone(),
            self.store.clone(),
            self.shards.clone(),
        ));
        let token = self.cancel.clone();
        self.tasks
            .spawn(async move { ingest.run("ingest", &fast(1, 10), token).await });

        for shard in self.shards.shards() {
            let processor = Arc::new(WebhookProcessor::new(
                shard.clone(),
                self.store.clone(),
                WebhookClient::with_defaults().unwrap(),
            ));
            let token = self.cancel.clone();
            self.tasks
                .spawn(async move { processor.run("deliver", &fast(2, 1), token).await });
        }
    }

    async fn register(&self, id: &str, max_blocks: u32, max_retries: u32) {
        let webhook = Webhook {
            id: id.into(),
            url: format!("{}/hook", self.server.uri()),
            chain_id: CHAIN.into(),
            max_retries,
            max_blocks,
            timeout_ms: 1_000,
        };
        assert!(self.shards.for_webhook(id).set_webhook(&webhook).await.unwrap());
    }

    async fn publish(&self, heights: impl IntoIterator<Item = u64>) {
        for h in heights {
            self.blocks.publish(&block(h)).await.unwrap();
        }
    }

    async fn pending(&self, id: &str) -> Vec<(u64, DeliveryMessage)> {
        self.shards
            .for_webhook(id)
            .pending_jobs()
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.webhook_id == id)
            .map(|j| (j.score, j.message))
            .collect()
    }

    /// Poll until `id` is pending at exactly `score` waiting for `next`.
    async fn wait_pending(&self, id: &str, score: u64, next: DeliveryMessage) {
        let want = vec![(score, next)];
        for _ in 0..250 {
            if self.pending(id).await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{id} never reached {want:?}, stuck at {:?}", self.pending(id).await);
    }

    /// Request bodies received so far, decoded.
    async fn posted(&self) -> Vec<Vec<String>> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    async fn stop(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            joined.unwrap().unwrap();
        }
    }
}

fn payloads(heights: &[u64]) -> Vec<String> {
    heights.iter().map(|h| block(*h).payload).collect()
}

#[tokio::test]
async fn registered_webhook_receives_latest_then_follows_chain() {
    let mut p = Pipeline::new(200).await;
    p.register("w1", 2, 3).await;
    assert_eq!(p.pending("w1").await, vec![(0, DeliveryMessage::initial("w1"))]);

    // Produce 1..=3 from a source before anything consumes them.
    let producer = BlockProducer::new(
        StaticBlockSource::new(CHAIN, (1..=3).map(block).collect()),
        p.blocks.clone(),
        p.store.clone(),
    );
    let stop_producer = CancellationToken::new();
    let producing = producer.run(Some(1), stop_producer.clone());
    let filled = async {
        while p.blocks.len().await.unwrap() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop_producer.cancel();
    };
    let (produced, ()) = tokio::join!(producing, filled);
    produced.unwrap();

    p.spawn_roles();
    p.wait_pending("w1", 3, DeliveryMessage::at("w1", 4)).await;
    assert_eq!(p.posted().await, vec![payloads(&[2, 3])]);

    // Re-flushing at or below the last height changes nothing.
    let shard = p.shards.for_webhook("w1");
    assert!(shard.flush(3).await.unwrap().is_empty());
    assert!(shard.flush(2).await.unwrap().is_empty());
    assert_eq!(p.pending("w1").await, vec![(3, DeliveryMessage::at("w1", 4))]);

    p.publish([4, 5]).await;
    p.wait_pending("w1", 5, DeliveryMessage::at("w1", 6)).await;
    let followed: Vec<String> = p.posted().await[1..].concat();
    assert_eq!(followed, payloads(&[4, 5]));

    p.stop().await;
}

#[tokio::test]
async fn failing_endpoint_skips_past_exhausted_ranges() {
    let mut p = Pipeline::new(503).await;
    p.register("w1", 2, 1).await;
    p.publish(1..=3).await;
    p.spawn_roles();

    // The initial range fails once, then is skipped past the newest block.
    p.wait_pending("w1", 3, DeliveryMessage::at("w1", 4)).await;
    assert_eq!(p.posted().await, vec![payloads(&[2, 3])]);

    // Each later range fails once and moves one height on; the last one
    // tried is [5] and the webhook ends up waiting for block 6.
    p.publish([4, 5]).await;
    p.wait_pending("w1", 5, DeliveryMessage::at("w1", 6)).await;
    let posted = p.posted().await;
    assert_eq!(posted.last(), Some(&payloads(&[5])));
    assert!(posted[1].starts_with(&payloads(&[4])));

    p.stop().await;
}

#[tokio::test]
async fn deleted_webhook_is_dropped_from_the_pipeline() {
    let mut p = Pipeline::new(200).await;
    p.register("w1", 1, 1).await;
    p.publish(1..=2).await;
    p.spawn_roles();
    p.wait_pending("w1", 2, DeliveryMessage::at("w1", 3)).await;

    assert!(p.shards.for_webhook("w1").delete_webhook("w1").await.unwrap());
    p.publish([3]).await;
    for _ in 0..250 {
        if p.store.get_latest_block(CHAIN).await.unwrap().map(|b| b.height) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(p.posted().await, vec![payloads(&[2])]);
    assert!(p.pending("w1").await.is_empty());
    p.stop().await;
}
