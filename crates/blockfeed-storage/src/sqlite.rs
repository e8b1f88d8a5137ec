//! SQLite block tier.
//!
//! One table holds every chain, partitioned by `chain_id` with a primary key
//! on `(chain_id, height)`. The same type serves as the durable tier
//! (`blocks` table) or as a cache tier shared between processes
//! (`block_cache` table).
//!
//! # Usage
//! ```rust,no_run
//! use blockfeed_storage::sqlite::SqliteBlockStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed durable tier
//! let durable = SqliteBlockStore::open("./blocks.db").await?;
//!
//! // Cache tier living in the shared log database
//! let cache = SqliteBlockStore::open_cache("./feed.db").await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use blockfeed_core::error::FeedError;
use blockfeed_core::store::{BlockStore, CacheTier};
use blockfeed_core::types::Block;

pub const DURABLE_TABLE: &str = "blocks";
pub const CACHE_TABLE: &str = "block_cache";

/// SQLite-backed block storage.
pub struct SqliteBlockStore {
    pool: SqlitePool,
    table: &'static str,
}

fn storage_err(e: sqlx::Error) -> FeedError {
    FeedError::Storage(e.to_string())
}

/// Normalise a plain path (`"./feed.db"`) into a SQLite URL.
pub(crate) fn sqlite_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite:{path}?mode=rwc")
    }
}

/// Connect to a SQLite file with WAL and a busy timeout, so several
/// processes can share it.
pub async fn connect_file(path: &str) -> Result<SqlitePool, FeedError> {
    let options = SqliteConnectOptions::from_str(&sqlite_url(path))
        .map_err(storage_err)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(storage_err)
}

/// An in-memory database lives and dies with its connection, so the pool is
/// pinned to one.
pub async fn connect_memory() -> Result<SqlitePool, FeedError> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .map_err(storage_err)
}

impl SqliteBlockStore {
    /// Open (or create) the durable tier at `path`.
    pub async fn open(path: &str) -> Result<Self, FeedError> {
        Self::with_pool(connect_file(path).await?, DURABLE_TABLE).await
    }

    /// Open (or create) a cache tier at `path`.
    pub async fn open_cache(path: &str) -> Result<Self, FeedError> {
        Self::with_pool(connect_file(path).await?, CACHE_TABLE).await
    }

    /// Open an in-memory database. Ideal for tests.
    pub async fn in_memory() -> Result<Self, FeedError> {
        Self::with_pool(connect_memory().await?, DURABLE_TABLE).await
    }

    /// Use an existing pool; `table` must be [`DURABLE_TABLE`] or [`CACHE_TABLE`].
    pub async fn with_pool(pool: SqlitePool, table: &'static str) -> Result<Self, FeedError> {
        if table != DURABLE_TABLE && table != CACHE_TABLE {
            return Err(FeedError::Config(format!("unknown block table '{table}'")));
        }
        let store = Self { pool, table };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), FeedError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                chain_id TEXT    NOT NULL,
                height   INTEGER NOT NULL,
                payload  TEXT    NOT NULL,
                PRIMARY KEY (chain_id, height)
            )",
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    fn rows_to_blocks(rows: Vec<sqlx::sqlite::SqliteRow>) -> Vec<Block> {
        rows.into_iter()
            .map(|row| Block {
                height: row.get::<i64, _>("height") as u64,
                payload: row.get("payload"),
            })
            .collect()
    }
}

#[async_trait]
impl BlockStore for SqliteBlockStore {
    async fn init(&self, _chain_id: &str) -> Result<(), FeedError> {
        self.init_schema().await
    }

    async fn put_blocks(&self, chain_id: &str, blocks: &[Block]) -> Result<(), FeedError> {
        if blocks.is_empty() {
            return Ok(());
        }
        // Bind limit is 999 per statement on older SQLite builds.
        for chunk in blocks.chunks(300) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} (chain_id, height, payload) ",
                self.table
            ));
            qb.push_values(chunk, |mut row, block| {
                row.push_bind(chain_id)
                    .push_bind(block.height as i64)
                    .push_bind(block.payload.as_str());
            });
            qb.push(" ON CONFLICT (chain_id, height) DO NOTHING");
            qb.build().execute(&self.pool).await.map_err(storage_err)?;
        }
        debug!(table = self.table, chain_id, count = blocks.len(), "blocks stored");
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
        let rows = sqlx::query(&format!(
            "SELECT height, payload FROM {}
             WHERE chain_id = ? AND height >= ? AND height <= ?
             ORDER BY height ASC",
            self.table
        ))
        .bind(chain_id)
        .bind(start as i64)
        .bind(end.min(i64::MAX as u64) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(Self::rows_to_blocks(rows))
    }

    async fn get_latest_block(&self, chain_id: &str) -> Result<Option<Block>, FeedError> {
        Ok(self.get_latest_blocks(chain_id, 1).await?.into_iter().next())
    }

    async fn get_latest_blocks(
        &self,
        chain_id: &str,
        limit: i64,
    ) -> Result<Vec<Block>, FeedError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT height, payload FROM {}
             WHERE chain_id = ? ORDER BY height DESC LIMIT ?",
            self.table
        ))
        .bind(chain_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(Self::rows_to_blocks(rows))
    }

    async fn get_earliest_height(&self, chain_id: &str) -> Result<Option<u64>, FeedError> {
        let row = sqlx::query(&format!(
            "SELECT MIN(height) AS h FROM {} WHERE chain_id = ?",
            self.table
        ))
        .bind(chain_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.get::<Option<i64>, _>("h").map(|h| h as u64))
    }
}

#[async_trait]
impl CacheTier for SqliteBlockStore {
    async fn get_earliest_blocks(
        &self,
        chain_id: &str,
        limit: i64,
    ) -> Result<Vec<Block>, FeedError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT height, payload FROM {}
             WHERE chain_id = ? ORDER BY height ASC LIMIT ?",
            self.table
        ))
        .bind(chain_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(Self::rows_to_blocks(rows))
    }

    async fn delete_blocks(&self, chain_id: &str, heights: &[u64]) -> Result<(), FeedError> {
        for chunk in heights.chunks(300) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "DELETE FROM {} WHERE chain_id = ",
                self.table
            ));
            qb.push_bind(chain_id).push(" AND height IN (");
            let mut sep = qb.separated(", ");
            for h in chunk {
                sep.push_bind(*h as i64);
            }
            qb.push(")");
            qb.build().execute(&self.pool).await.map_err(storage_err)?;
        }
        Ok(())
    }

    async fn count_blocks(&self, chain_id: &str) -> Result<u64, FeedError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE chain_id = ?",
            self.table
        ))
        .bind(chain_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(heights: &[u64]) -> Vec<Block> {
        heights
            .iter()
            .map(|h| Block::new(*h, format!(r#"{{"number":{h}}}"#)))
            .collect()
    }

    fn heights(blocks: &[Block]) -> Vec<u64> {
        blocks.iter().map(|b| b.height).collect()
    }

    #[tokio::test]
    async fn put_twice_keeps_one_copy() {
        let store = SqliteBlockStore::in_memory().await.unwrap();
        store.put_blocks("eth", &blocks(&[1, 2, 3])).await.unwrap();
        store.put_blocks("eth", &blocks(&[2, 3, 4])).await.unwrap();
        let got = store.get_blocks("eth", 0, 100).await.unwrap();
        assert_eq!(heights(&got), vec![1, 2, 3, 4]);
        assert_eq!(got[0].payload, r#"{"number":1}"#);
        assert_eq!(store.count_blocks("eth").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn range_is_inclusive_and_ascending() {
        let store = SqliteBlockStore::in_memory().await.unwrap();
        store.put_blocks("eth", &blocks(&[10, 11, 13, 15])).await.unwrap();
        let got = store.get_blocks("eth", 11, 15).await.unwrap();
        assert_eq!(heights(&got), vec![11, 13, 15]);
        assert!(store.get_blocks("eth", 15, 11).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chains_are_isolated() {
        let store = SqliteBlockStore::in_memory().await.unwrap();
        store.put_blocks("eth", &blocks(&[1, 2])).await.unwrap();
        store.put_blocks("base", &blocks(&[7])).await.unwrap();
        assert_eq!(heights(&store.get_blocks("eth", 0, 10).await.unwrap()), vec![1, 2]);
        assert_eq!(store.get_latest_block("base").await.unwrap().unwrap().height, 7);
    }

    #[tokio::test]
    async fn latest_earliest_and_delete() {
        let store = SqliteBlockStore::in_memory().await.unwrap();
        assert!(store.get_latest_block("eth").await.unwrap().is_none());
        assert_eq!(store.get_earliest_height("eth").await.unwrap(), None);

        store.put_blocks("eth", &blocks(&[3, 1, 2, 5])).await.unwrap();
        assert_eq!(heights(&store.get_latest_blocks("eth", 3).await.unwrap()), vec![5, 3, 2]);
        assert!(store.get_latest_blocks("eth", 0).await.unwrap().is_empty());
        assert_eq!(heights(&store.get_earliest_blocks("eth", 2).await.unwrap()), vec![1, 2]);
        assert_eq!(store.get_earliest_height("eth").await.unwrap(), Some(1));

        store.delete_blocks("eth", &[1, 2]).await.unwrap();
        assert_eq!(store.get_earliest_height("eth").await.unwrap(), Some(3));
        assert_eq!(store.count_blocks("eth").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_table_rejected() {
        let pool = connect_memory().await.unwrap();
        assert!(SqliteBlockStore::with_pool(pool, "events").await.is_err());
    }

    #[test]
    fn url_normalisation() {
        assert_eq!(sqlite_url("./feed.db"), "sqlite:./feed.db?mode=rwc");
        assert_eq!(sqlite_url("sqlite::memory:"), "sqlite::memory:");
    }
}
