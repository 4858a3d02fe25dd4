use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::placeholders;
use crate::error::Result;

const DELETE_CHUNK: usize = 500;

/// Raw message bytes keyed by `(mailbox, id)`, the second half of every
/// stored message.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, mailbox: &str, id: &str, raw: &[u8]) -> Result<()>;
    async fn get(&self, mailbox: &str, id: &str) -> Result<Option<Vec<u8>>>;
    /// Removes every listed blob that exists and returns how many were removed.
    async fn delete(&self, mailbox: &str, ids: &[String]) -> Result<u64>;
}

#[derive(Clone)]
pub struct SqliteBlobStore {
    pool: SqlitePool,
}

impl SqliteBlobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, mailbox: &str, id: &str, raw: &[u8]) -> Result<()> {
        sqlx::query("INSERT INTO mailbox_data (mailbox, id, raw) VALUES (?, ?, ?)")
            .bind(mailbox)
            .bind(id)
            .bind(raw)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, mailbox: &str, id: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query_as::<_, (Vec<u8>,)>(
            "SELECT raw FROM mailbox_data WHERE mailbox = ? AND id = ?",
        )
        .bind(mailbox)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn delete(&self, mailbox: &str, ids: &[String]) -> Result<u64> {
        let mut removed = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let query = format!(
                "DELETE FROM mailbox_data WHERE mailbox = ? AND id IN ({})",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query(&query).bind(mailbox);
            for id in chunk {
                q = q.bind(id);
            }
            removed += q.execute(&self.pool).await?.rows_affected();
        }
        Ok(removed)
    }
}
