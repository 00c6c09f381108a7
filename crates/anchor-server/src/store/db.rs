//! Cache store handle and schema migrations.

use std::path::Path;

use anchor_core::db::{DatabaseError, open_pool, open_pool_in_memory};
use sqlx::{Pool, Sqlite, Transaction};
use tracing::info;

/// Account cache backed by `SQLite`. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct CacheStore {
    pool: Pool<Sqlite>,
}

impl CacheStore {
    /// Open or create the cache at `path` and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(open_pool(path).await?).await
    }

    /// Open a private in-memory cache.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(open_pool_in_memory().await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        info!("Cache store migrations complete");
        Ok(Self { pool })
    }

    pub(super) const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Start a transaction that takes the write lock up front, so concurrent
    /// writers wait out the busy timeout instead of failing on lock upgrade.
    pub(super) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, DatabaseError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}
