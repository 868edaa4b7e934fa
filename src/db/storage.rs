// Hit storage boundary
// Everything the memstore and maintenance tasks need from persistent storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::hit::Hit;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Persistent hit storage.
///
/// `persist` must be idempotent per `Hit::hit_id`: a batch that failed may be
/// handed over again on the next drain.
#[async_trait]
pub trait HitStorage: Send + Sync {
    async fn persist(&self, batch: &[Hit]) -> Result<(), StorageError>;

    /// Remove hits created before `cutoff`
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<(), StorageError>;
}
