//! PostgreSQL durable block tier.
//!
//! # Feature Flag
//! Requires the `postgres` feature:
//! ```toml
//! blockfeed-storage = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! # Schema
//! `blockfeed_blocks (chain_id, height, payload)` with a primary key on
//! `(chain_id, height)`, created on first connect.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use blockfeed_core::error::FeedError;
use blockfeed_core::store::BlockStore;
use blockfeed_core::types::Block;

// ─── Connection options ────────────────────────────────────────────────────────

/// Connection options for the Postgres block tier.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Minimum number of idle connections to keep open (default: 1)
    pub min_connections: u32,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
        }
    }
}

// ─── PostgresBlockStore ──────────────────────────────────────────────────────

/// Cheaply cloneable; wraps a connection pool.
#[derive(Clone)]
pub struct PostgresBlockStore {
    pool: PgPool,
}

fn storage_err(e: sqlx::Error) -> FeedError {
    FeedError::Storage(e.to_string())
}

impl PostgresBlockStore {
    /// `postgresql://[user[:password]@][host][:port][/dbname]`
    pub async fn connect(database_url: &str) -> Result<Self, FeedError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, FeedError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(opts.connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| FeedError::Storage(format!("postgres connect: {e}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("PostgresBlockStore connected and schema initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), FeedError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blockfeed_blocks (
                chain_id TEXT   NOT NULL,
                height   BIGINT NOT NULL,
                payload  TEXT   NOT NULL,
                PRIMARY KEY (chain_id, height)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    fn rows_to_blocks(rows: Vec<PgRow>) -> Vec<Block> {
        rows.into_iter()
            .map(|row| Block {
                height: row.get::<i64, _>("height") as u64,
                payload: row.get("payload"),
            })
            .collect()
    }
}

#[async_trait]
impl BlockStore for PostgresBlockStore {
    async fn init(&self, _chain_id: &str) -> Result<(), FeedError> {
        self.init_schema().await
    }

    async fn put_blocks(&self, chain_id: &str, blocks: &[Block]) -> Result<(), FeedError> {
        for chunk in blocks.chunks(1000) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO blockfeed_blocks (chain_id, height, payload) ");
            qb.push_values(chunk, |mut row, block| {
                row.push_bind(chain_id)
                    .push_bind(block.height as i64)
                    .push_bind(block.payload.as_str());
            });
            qb.push(" ON CONFLICT (chain_id, height) DO NOTHING");
            qb.build().execute(&self.pool).await.map_err(storage_err)?;
        }
        debug!(chain_id, count = blocks.len(), "blocks stored");
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
        let rows = sqlx::query(
            "SELECT height, payload FROM blockfeed_blocks
             WHERE chain_id = $1 AND height BETWEEN $2 AND $3
             ORDER BY height ASC",
        )
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
        let rows = sqlx::query(
            "SELECT height, payload FROM blockfeed_blocks
             WHERE chain_id = $1 ORDER BY height DESC LIMIT $2",
        )
        .bind(chain_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(Self::rows_to_blocks(rows))
    }

    async fn get_earliest_height(&self, chain_id: &str) -> Result<Option<u64>, FeedError> {
        let row = sqlx::query("SELECT MIN(height) AS h FROM blockfeed_blocks WHERE chain_id = $1")
            .bind(chain_id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<Option<i64>, _>("h").map(|h| h as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Set DATABASE_URL environment variable to enable.
    // Example: DATABASE_URL=postgresql://localhost/blockfeed_test cargo test --features postgres

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_blocks_roundtrip() {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let store = PostgresBlockStore::connect(&url).await.unwrap();
        let chain = format!("test-{}", std::process::id());

        let blocks: Vec<Block> = (1..=5).map(|h| Block::new(h, format!("{{\"n\":{h}}}"))).collect();
        store.put_blocks(&chain, &blocks).await.unwrap();
        store.put_blocks(&chain, &blocks).await.unwrap();

        let got = store.get_blocks(&chain, 2, 4).await.unwrap();
        assert_eq!(got.iter().map(|b| b.height).collect::<Vec<_>>(), vec![2, 3, 4]);
        let latest = store.get_latest_blocks(&chain, 2).await.unwrap();
        assert_eq!(latest.iter().map(|b| b.height).collect::<Vec<_>>(), vec![5, 4]);
        assert_eq!(store.get_earliest_height(&chain).await.unwrap(), Some(1));
    }
}
