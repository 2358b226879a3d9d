use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;

use crate::Storage;

/// Handle to a stored blob. `path` is the stable address; the rest is metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub path: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
}

impl BlobRef {
    /// Last path segment, which is how uploaded documents are identified.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Content-addressed-by-path storage for uploaded documents and message attachments.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8], mime_type: Option<&str>) -> Result<BlobRef>;
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
    /// Blobs whose path starts with `prefix`, ordered by path.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<BlobRef>>;
    async fn delete(&self, path: &str) -> Result<bool>;
}

#[async_trait]
impl BlobStore for Storage {
    async fn put(&self, path: &str, bytes: &[u8], mime_type: Option<&str>) -> Result<BlobRef> {
        let size_bytes = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO blobs (path, content, mime_type, size_bytes, created_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(path) DO UPDATE SET
                content = excluded.content,
                mime_type = excluded.mime_type,
                size_bytes = excluded.size_bytes,
                created_at = CURRENT_TIMESTAMP",
        )
        .bind(path)
        .bind(bytes)
        .bind(mime_type)
        .bind(size_bytes)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to store blob '{path}'"))?;

        Ok(BlobRef {
            path: path.to_string(),
            size_bytes: bytes.len() as u64,
            mime_type: mime_type.map(str::to_string),
        })
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT content FROM blobs WHERE path = ?")
            .bind(path)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("failed to load blob '{path}'"))?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<BlobRef>> {
        let rows = sqlx::query(
            "SELECT path, size_bytes, mime_type FROM blobs
             WHERE substr(path, 1, length(?1)) = ?1
             ORDER BY path ASC",
        )
        .bind(prefix)
        .fetch_all(self.pool())
        .await
        .with_context(|| format!("failed to list blobs under '{prefix}'"))?;

        Ok(rows
            .into_iter()
            .map(|r| BlobRef {
                path: r.get::<String, _>(0),
                size_bytes: r.get::<i64, _>(1).max(0) as u64,
                mime_type: r.get::<Option<String>, _>(2),
            })
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM blobs WHERE path = ?")
            .bind(path)
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to delete blob '{path}'"))?
            .rows_affected();
        Ok(affected > 0)
    }
}
