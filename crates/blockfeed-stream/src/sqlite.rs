//! SQLite log and scheduler backend.
//!
//! Several processes can share one database file. Each operation runs in a
//! single transaction whose first statement takes the write lock, so
//! promotion, re-arming and consumer-group bookkeeping never interleave.
//!
//! # Schema
//! - `log_messages` : every topic's entries, id = AUTOINCREMENT rowid
//! - `log_groups`   : per-group read cursor
//! - `log_pending`  : per-message delivery records (consumer, count)
//! - `shard_webhooks`, `shard_pending`, `shard_cursors`: scheduler state

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use blockfeed_core::error::FeedError;
use blockfeed_core::shard::ShardId;
use blockfeed_core::types::DeliveryMessage;
use blockfeed_core::webhook::Webhook;

use crate::backend::{
    rearm_target, LogBackend, LogMessage, MessageId, PendingEntry, PendingJob, Rearm,
    RearmMode, ScheduleBackend,
};

fn log_err(e: sqlx::Error) -> FeedError {
    FeedError::Log(e.to_string())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SQLite-backed [`LogBackend`] + [`ScheduleBackend`].
#[derive(Clone)]
pub struct SqliteLog {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqliteLog {
    /// Open (or create) a database at `path` (plain path or `sqlite:` URL).
    pub async fn open(path: &str) -> Result<Self, FeedError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(log_err)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(log_err)?;
        Self::with_pool(pool).await
    }

    /// In-memory database on a single pinned connection. Ideal for tests.
    pub async fn in_memory() -> Result<Self, FeedError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(log_err)?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, FeedError> {
        let log = Self {
            pool,
            poll_interval: Duration::from_millis(100),
        };
        log.init_schema().await?;
        Ok(log)
    }

    /// How often blocked readers re-check for new messages.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), FeedError> {
        let statements = [
            "PRAGMA journal_mode=WAL;",
            "CREATE TABLE IF NOT EXISTS feed_lock (
                id    INTEGER PRIMARY KEY CHECK (id = 1),
                epoch INTEGER NOT NULL
            )",
            "INSERT OR IGNORE INTO feed_lock (id, epoch) VALUES (1, 0)",
            "CREATE TABLE IF NOT EXISTS log_messages (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                topic   TEXT    NOT NULL,
                payload TEXT    NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_log_messages_topic ON log_messages(topic, id)",
            "CREATE TABLE IF NOT EXISTS log_groups (
                topic             TEXT    NOT NULL,
                grp               TEXT    NOT NULL,
                last_delivered_id INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (topic, grp)
            )",
            "CREATE TABLE IF NOT EXISTS log_pending (
                topic             TEXT    NOT NULL,
                grp               TEXT    NOT NULL,
                message_id        INTEGER NOT NULL,
                consumer          TEXT    NOT NULL,
                deliveries        INTEGER NOT NULL,
                last_delivered_ms INTEGER NOT NULL,
                PRIMARY KEY (topic, grp, message_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_log_pending_consumer
                ON log_pending(topic, grp, consumer, message_id)",
            "CREATE TABLE IF NOT EXISTS shard_webhooks (
                shard      INTEGER NOT NULL,
                webhook_id TEXT    NOT NULL,
                definition TEXT    NOT NULL,
                PRIMARY KEY (shard, webhook_id)
            )",
            "CREATE TABLE IF NOT EXISTS shard_pending (
                shard      INTEGER NOT NULL,
                webhook_id TEXT    NOT NULL,
                score      INTEGER NOT NULL,
                message    TEXT    NOT NULL,
                PRIMARY KEY (shard, webhook_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_shard_pending_score ON shard_pending(shard, score)",
            "CREATE TABLE IF NOT EXISTS shard_cursors (
                shard                 INTEGER PRIMARY KEY,
                latest_flushed_height INTEGER NOT NULL
            )",
        ];
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(log_err)?;
        }
        Ok(())
    }

    /// Begin a transaction that already holds the database write lock.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, FeedError> {
        let mut tx = self.pool.begin().await.map_err(log_err)?;
        sqlx::query("UPDATE feed_lock SET epoch = epoch + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await
            .map_err(log_err)?;
        Ok(tx)
    }
}

// ─── Statement helpers (run inside a caller's transaction) ───────────────────

async fn append_in(
    conn: &mut SqliteConnection,
    topic: &str,
    payload: &str,
    max_len: Option<usize>,
) -> Result<MessageId, FeedError> {
    let id = sqlx::query("INSERT INTO log_messages (topic, payload) VALUES (?, ?)")
        .bind(topic)
        .bind(payload)
        .execute(&mut *conn)
        .await
        .map_err(log_err)?
        .last_insert_rowid();

    if let Some(max_len) = max_len {
        sqlx::query(
            "DELETE FROM log_messages WHERE topic = ? AND id NOT IN (
                SELECT id FROM log_messages WHERE topic = ? ORDER BY id DESC LIMIT ?
            )",
        )
        .bind(topic)
        .bind(topic)
        .bind(max_len as i64)
        .execute(&mut *conn)
        .await
        .map_err(log_err)?;
    }
    Ok(MessageId(id as u64))
}

async fn ack_del_in(
    conn: &mut SqliteConnection,
    topic: &str,
    group: &str,
    ids: &[MessageId],
) -> Result<(), FeedError> {
    for id in ids {
        sqlx::query("DELETE FROM log_pending WHERE topic = ? AND grp = ? AND message_id = ?")
            .bind(topic)
            .bind(group)
            .bind(id.0 as i64)
            .execute(&mut *conn)
            .await
            .map_err(log_err)?;
        sqlx::query("DELETE FROM log_messages WHERE topic = ? AND id = ?")
            .bind(topic)
            .bind(id.0 as i64)
            .execute(&mut *conn)
            .await
            .map_err(log_err)?;
    }
    Ok(())
}

async fn group_cursor(
    conn: &mut SqliteConnection,
    topic: &str,
    group: &str,
) -> Result<i64, FeedError> {
    let row = sqlx::query("SELECT last_delivered_id FROM log_groups WHERE topic = ? AND grp = ?")
        .bind(topic)
        .bind(group)
        .fetch_optional(&mut *conn)
        .await
        .map_err(log_err)?;
    row.map(|r| r.get::<i64, _>("last_delivered_id"))
        .ok_or_else(|| FeedError::Log(format!("consumer group '{group}' does not exist on '{topic}'")))
}

async fn latest_flushed_in(
    conn: &mut SqliteConnection,
    shard: ShardId,
) -> Result<Option<u64>, FeedError> {
    let row = sqlx::query("SELECT latest_flushed_height FROM shard_cursors WHERE shard = ?")
        .bind(shard.0 as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(log_err)?;
    Ok(row.map(|r| r.get::<i64, _>("latest_flushed_height") as u64))
}

async fn upsert_job_in(
    conn: &mut SqliteConnection,
    shard: ShardId,
    job: &PendingJob,
) -> Result<(), FeedError> {
    sqlx::query(
        "INSERT INTO shard_pending (shard, webhook_id, score, message) VALUES (?, ?, ?, ?)
         ON CONFLICT (shard, webhook_id) DO UPDATE SET score = excluded.score, message = excluded.message",
    )
    .bind(shard.0 as i64)
    .bind(&job.webhook_id)
    .bind(job.score as i64)
    .bind(serde_json::to_string(&job.message)?)
    .execute(&mut *conn)
    .await
    .map_err(log_err)?;
    Ok(())
}

fn row_to_job(row: &SqliteRow) -> Result<PendingJob, FeedError> {
    let message: DeliveryMessage = serde_json::from_str(row.get::<&str, _>("message"))?;
    Ok(PendingJob {
        webhook_id: row.get("webhook_id"),
        score: row.get::<i64, _>("score") as u64,
        message,
    })
}

#[async_trait]
impl LogBackend for SqliteLog {
    async fn create_group(&self, topic: &str, group: &str) -> Result<(), FeedError> {
        sqlx::query("INSERT OR IGNORE INTO log_groups (topic, grp, last_delivered_id) VALUES (?, ?, 0)")
            .bind(topic)
            .bind(group)
            .execute(&self.pool)
            .await
            .map_err(log_err)?;
        Ok(())
    }

    async fn append(
        &self,
        topic: &str,
        payload: &str,
        max_len: Option<usize>,
    ) -> Result<MessageId, FeedError> {
        let mut tx = self.begin_write().await?;
        let id = append_in(&mut tx, topic, payload, max_len).await?;
        tx.commit().await.map_err(log_err)?;
        Ok(id)
    }

    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogMessage>, FeedError> {
        let mut tx = self.begin_write().await?;
        let cursor = group_cursor(&mut tx, topic, group).await?;

        let rows = sqlx::query(
            "SELECT id, payload FROM log_messages WHERE topic = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(topic)
        .bind(cursor)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(log_err)?;

        let messages: Vec<LogMessage> = rows
            .iter()
            .map(|r| LogMessage {
                id: MessageId(r.get::<i64, _>("id") as u64),
                payload: r.get("payload"),
            })
            .collect();

        if let Some(last) = messages.last() {
            let now = now_ms();
            for msg in &messages {
                sqlx::query(
                    "INSERT OR REPLACE INTO log_pending
                        (topic, grp, message_id, consumer, deliveries, last_delivered_ms)
                     VALUES (?, ?, ?, ?, 1, ?)",
                )
                .bind(topic)
                .bind(group)
                .bind(msg.id.0 as i64)
                .bind(consumer)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(log_err)?;
            }
            sqlx::query("UPDATE log_groups SET last_delivered_id = ? WHERE topic = ? AND grp = ?")
                .bind(last.id.0 as i64)
                .bind(topic)
                .bind(group)
                .execute(&mut *tx)
                .await
                .map_err(log_err)?;
        }

        tx.commit().await.map_err(log_err)?;
        Ok(messages)
    }

    async fn read_backlog(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: MessageId,
        count: usize,
    ) -> Result<Vec<LogMessage>, FeedError> {
        let mut tx = self.begin_write().await?;
        group_cursor(&mut tx, topic, group).await?;

        let stale = sqlx::query(
            "DELETE FROM log_pending
             WHERE topic = ? AND grp = ? AND consumer = ? AND message_id > ?
               AND message_id NOT IN (SELECT id FROM log_messages WHERE topic = ?)",
        )
        .bind(topic)
        .bind(group)
        .bind(consumer)
        .bind(after.0 as i64)
        .bind(topic)
        .execute(&mut *tx)
        .await
        .map_err(log_err)?
        .rows_affected();
        if stale > 0 {
            debug!(topic, group, consumer, count = stale, "dropped stale backlog entries");
        }

        let rows = sqlx::query(
            "SELECT m.id, m.payload FROM log_pending p
             JOIN log_messages m ON m.id = p.message_id AND m.topic = p.topic
             WHERE p.topic = ? AND p.grp = ? AND p.consumer = ? AND p.message_id > ?
             ORDER BY p.message_id ASC LIMIT ?",
        )
        .bind(topic)
        .bind(group)
        .bind(consumer)
        .bind(after.0 as i64)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(log_err)?;

        let messages: Vec<LogMessage> = rows
            .iter()
            .map(|r| LogMessage {
                id: MessageId(r.get::<i64, _>("id") as u64),
                payload: r.get("payload"),
            })
            .collect();

        let now = now_ms();
        for msg in &messages {
            sqlx::query(
                "UPDATE log_pending SET deliveries = deliveries + 1, last_delivered_ms = ?
                 WHERE topic = ? AND grp = ? AND message_id = ?",
            )
            .bind(now)
            .bind(topic)
            .bind(group)
            .bind(msg.id.0 as i64)
            .execute(&mut *tx)
            .await
            .map_err(log_err)?;
        }

        tx.commit().await.map_err(log_err)?;
        Ok(messages)
    }

    async fn pending_entry(
        &self,
        topic: &str,
        group: &str,
        id: MessageId,
    ) -> Result<Option<PendingEntry>, FeedError> {
        let row = sqlx::query(
            "SELECT consumer, deliveries, last_delivered_ms FROM log_pending
             WHERE topic = ? AND grp = ? AND message_id = ?",
        )
        .bind(topic)
        .bind(group)
        .bind(id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(log_err)?;
        Ok(row.map(|r| PendingEntry {
            id,
            consumer: r.get("consumer"),
            deliveries: r.get::<i64, _>("deliveries") as u32,
            last_delivered_ms: r.get("last_delivered_ms"),
        }))
    }

    async fn ack_del(
        &self,
        topic: &str,
        group: &str,
        ids: &[MessageId],
        replacement: Option<&str>,
    ) -> Result<Option<MessageId>, FeedError> {
        let mut tx = self.begin_write().await?;
        ack_del_in(&mut tx, topic, group, ids).await?;
        let replaced = match replacement {
            Some(payload) => Some(append_in(&mut tx, topic, payload, None).await?),
            None => None,
        };
        tx.commit().await.map_err(log_err)?;
        Ok(replaced)
    }

    async fn topic_len(&self, topic: &str) -> Result<u64, FeedError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM log_messages WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await
            .map_err(log_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    async fn wait_for_messages(&self, _topic: &str, timeout: Duration) {
        tokio::time::sleep(timeout.min(self.poll_interval)).await;
    }
}

#[async_trait]
impl ScheduleBackend for SqliteLog {
    async fn set_webhook(&self, shard: ShardId, webhook: &Webhook) -> Result<bool, FeedError> {
        let definition = serde_json::to_string(webhook)?;
        let mut tx = self.begin_write().await?;

        let existed = sqlx::query("SELECT 1 FROM shard_webhooks WHERE shard = ? AND webhook_id = ?")
            .bind(shard.0 as i64)
            .bind(&webhook.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(log_err)?
            .is_some();

        sqlx::query(
            "INSERT INTO shard_webhooks (shard, webhook_id, definition) VALUES (?, ?, ?)
             ON CONFLICT (shard, webhook_id) DO UPDATE SET definition = excluded.definition",
        )
        .bind(shard.0 as i64)
        .bind(&webhook.id)
        .bind(&definition)
        .execute(&mut *tx)
        .await
        .map_err(log_err)?;

        if !existed {
            let job = PendingJob {
                webhook_id: webhook.id.clone(),
                score: 0,
                message: DeliveryMessage::initial(webhook.id.clone()),
            };
            upsert_job_in(&mut tx, shard, &job).await?;
        }

        tx.commit().await.map_err(log_err)?;
        Ok(!existed)
    }

    async fn get_webhook(&self, shard: ShardId, id: &str) -> Result<Option<Webhook>, FeedError> {
        let row = sqlx::query("SELECT definition FROM shard_webhooks WHERE shard = ? AND webhook_id = ?")
            .bind(shard.0 as i64)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(log_err)?;
        match row {
            Some(r) => Ok(Some(serde_json::from_str(r.get::<&str, _>("definition"))?)),
            None => Ok(None),
        }
    }

    async fn delete_webhook(&self, shard: ShardId, id: &str) -> Result<bool, FeedError> {
        let mut tx = self.begin_write().await?;
        sqlx::query("DELETE FROM shard_pending WHERE shard = ? AND webhook_id = ?")
            .bind(shard.0 as i64)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(log_err)?;
        let removed = sqlx::query("DELETE FROM shard_webhooks WHERE shard = ? AND webhook_id = ?")
            .bind(shard.0 as i64)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(log_err)?
            .rows_affected();
        tx.commit().await.map_err(log_err)?;
        Ok(removed > 0)
    }

    async fn flush_pending(
        &self,
        shard: ShardId,
        latest_height: u64,
    ) -> Result<Vec<PendingJob>, FeedError> {
        let mut tx = self.begin_write().await?;

        sqlx::query(
            "INSERT INTO shard_cursors (shard, latest_flushed_height) VALUES (?, ?)
             ON CONFLICT (shard) DO UPDATE SET latest_flushed_height =
                MAX(latest_flushed_height, excluded.latest_flushed_height)",
        )
        .bind(shard.0 as i64)
        .bind(latest_height as i64)
        .execute(&mut *tx)
        .await
        .map_err(log_err)?;

        let max_score = sqlx::query("SELECT MAX(score) AS s FROM shard_pending WHERE shard = ?")
            .bind(shard.0 as i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(log_err)?
            .get::<Option<i64>, _>("s");

        let rows = match max_score {
            None => Vec::new(),
            // Every member is behind: take the whole set.
            Some(max) if (max as u64) < latest_height => {
                sqlx::query(
                    "SELECT webhook_id, score, message FROM shard_pending
                     WHERE shard = ? ORDER BY score ASC, webhook_id ASC",
                )
                .bind(shard.0 as i64)
                .fetch_all(&mut *tx)
                .await
                .map_err(log_err)?
            }
            Some(_) => {
                sqlx::query(
                    "SELECT webhook_id, score, message FROM shard_pending
                     WHERE shard = ? AND score < ? ORDER BY score ASC, webhook_id ASC",
                )
                .bind(shard.0 as i64)
                .bind(latest_height as i64)
                .fetch_all(&mut *tx)
                .await
                .map_err(log_err)?
            }
        };
        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;

        let topic = shard.delivery_topic();
        for job in &jobs {
            sqlx::query("DELETE FROM shard_pending WHERE shard = ? AND webhook_id = ?")
                .bind(shard.0 as i64)
                .bind(&job.webhook_id)
                .execute(&mut *tx)
                .await
                .map_err(log_err)?;
            append_in(&mut tx, &topic, &serde_json::to_string(&job.message)?, None).await?;
        }

        tx.commit().await.map_err(log_err)?;
        Ok(jobs)
    }

    async fn ack_and_rearm(
        &self,
        shard: ShardId,
        group: &str,
        id: MessageId,
        next: &DeliveryMessage,
        mode: RearmMode,
    ) -> Result<Rearm, FeedError> {
        let topic = shard.delivery_topic();
        let mut tx = self.begin_write().await?;
        ack_del_in(&mut tx, &topic, group, &[id]).await?;

        let latest = latest_flushed_in(&mut tx, shard).await?;
        let outcome = match rearm_target(next, latest, mode) {
            Some(score) => {
                let job = PendingJob {
                    webhook_id: next.webhook_id.clone(),
                    score,
                    message: next.clone(),
                };
                upsert_job_in(&mut tx, shard, &job).await?;
                Rearm::Pending { score }
            }
            None => {
                let payload = serde_json::to_string(next)?;
                Rearm::Promoted(append_in(&mut tx, &topic, &payload, None).await?)
            }
        };

        tx.commit().await.map_err(log_err)?;
        Ok(outcome)
    }

    async fn latest_flushed_height(&self, shard: ShardId) -> Result<Option<u64>, FeedError> {
        let mut conn = self.pool.acquire().await.map_err(log_err)?;
        latest_flushed_in(&mut conn, shard).await
    }

    async fn pending_jobs(&self, shard: ShardId) -> Result<Vec<PendingJob>, FeedError> {
        let rows = sqlx::query(
            "SELECT webhook_id, score, message FROM shard_pending
             WHERE shard = ? ORDER BY score ASC, webhook_id ASC",
        )
        .bind(shard.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(log_err)?;
        rows.iter().map(row_to_job).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: &str = "topic";
    const G: &str = "group";

    fn hook(id: &str) -> Webhook {
        Webhook {
            id: id.into(),
            url: "http://localhost:9/hook".into(),
            chain_id: "eth".into(),
            max_retries: 3,
            max_blocks: 2,
            timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn consumer_group_roundtrip() {
        let log = SqliteLog::in_memory().await.unwrap();
        log.append(T, "a", None).await.unwrap();
        log.create_group(T, G).await.unwrap();
        log.create_group(T, G).await.unwrap();

        let msgs = log.read_new(T, G, "c-0", 10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(log.read_new(T, G, "c-0", 10).await.unwrap().is_empty());

        let again = log.read_backlog(T, G, "c-0", MessageId(0), 10).await.unwrap();
        assert_eq!(again, msgs);
        assert!(log.read_backlog(T, G, "c-1", MessageId(0), 10).await.unwrap().is_empty());
        let entry = log.pending_entry(T, G, msgs[0].id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count(), 1);

        let next = log.ack_del(T, G, &[msgs[0].id], Some("b")).await.unwrap().unwrap();
        assert!(next > msgs[0].id);
        assert!(log.pending_entry(T, G, msgs[0].id).await.unwrap().is_none());
        assert_eq!(log.topic_len(T).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn trimmed_messages_leave_backlog() {
        let log = SqliteLog::in_memory().await.unwrap();
        log.create_group(T, G).await.unwrap();
        log.append(T, "1", Some(1)).await.unwrap();
        log.read_new(T, G, "c-0", 1).await.unwrap();
        log.append(T, "2", Some(1)).await.unwrap();
        assert_eq!(log.topic_len(T).await.unwrap(), 1);
        assert!(log.read_backlog(T, G, "c-0", MessageId(0), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_group_is_an_error() {
        let log = SqliteLog::in_memory().await.unwrap();
        assert!(matches!(log.read_new(T, "nope", "c-0", 1).await, Err(FeedError::Log(_))));
    }

    #[tokio::test]
    async fn register_flush_and_rearm() {
        let log = SqliteLog::in_memory().await.unwrap();
        let shard = ShardId(0);

        assert!(log.set_webhook(shard, &hook("w1")).await.unwrap());
        assert!(!log.set_webhook(shard, &hook("w1")).await.unwrap());
        let jobs = log.pending_jobs(shard).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].score, 0);
        assert!(jobs[0].message.is_new);

        let promoted = log.flush_pending(shard, 3).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert!(log.pending_jobs(shard).await.unwrap().is_empty());
        assert_eq!(log.latest_flushed_height(shard).await.unwrap(), Some(3));

        let topic = shard.delivery_topic();
        log.create_group(&topic, G).await.unwrap();
        let msg = log.read_new(&topic, G, "c-0", 1).await.unwrap().remove(0);
        let parsed: DeliveryMessage = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(parsed, DeliveryMessage::initial("w1"));

        let outcome = log
            .ack_and_rearm(shard, G, msg.id, &DeliveryMessage::at("w1", 4), RearmMode::Schedule)
            .await
            .unwrap();
        assert_eq!(outcome, Rearm::Pending { score: 3 });
        assert_eq!(log.topic_len(&topic).await.unwrap(), 0);

        // A lower flush leaves it waiting; the cursor never moves backwards.
        assert!(log.flush_pending(shard, 2).await.unwrap().is_empty());
        assert_eq!(log.latest_flushed_height(shard).await.unwrap(), Some(3));
        assert_eq!(log.flush_pending(shard, 4).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_definition_and_pending_job() {
        let log = SqliteLog::in_memory().await.unwrap();
        let shard = ShardId(1);
        log.set_webhook(shard, &hook("w1")).await.unwrap();
        assert!(log.get_webhook(shard, "w1").await.unwrap().is_some());
        assert!(log.delete_webhook(shard, "w1").await.unwrap());
        assert!(!log.delete_webhook(shard, "w1").await.unwrap());
        assert!(log.get_webhook(shard, "w1").await.unwrap().is_none());
        assert!(log.pending_jobs(shard).await.unwrap().is_empty());
    }
}
