// In-process hit storage
// Used when no ClickHouse URL is configured, and by tests to inject failures

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Mutex, PoisonError,
};
use std::time::Duration;
use uuid::Uuid;

use super::storage::{HitStorage, StorageError};
use crate::models::hit::Hit;

/// Hit storage backed by a map keyed on hit id
#[derive(Debug, Default)]
pub struct MemoryHitStorage {
    hits: Mutex<HashMap<Uuid, Hit>>,
    fail_next: AtomicUsize,
    persist_calls: AtomicU64,
    duplicate_writes: AtomicU64,
    latency: Option<Duration>,
}

impl MemoryHitStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persist call sleeps for `latency` before writing
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Make the next `n` persist calls fail without writing anything
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stored hits ordered by creation time
    pub fn hits(&self) -> Vec<Hit> {
        let mut hits: Vec<Hit> = self.lock().values().cloned().collect();
        hits.sort_by_key(|hit| hit.created_at);
        hits
    }

    pub fn persist_calls(&self) -> u64 {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Writes that hit an id already stored
    pub fn duplicate_writes(&self) -> u64 {
        self.duplicate_writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Hit>> {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl HitStorage for MemoryHitStorage {
    async fn persist(&self, batch: &[Hit]) -> Result<(), StorageError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.take_failure() {
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }

        let mut hits = self.lock();
        for hit in batch {
            if hits.insert(hit.hit_id, hit.clone()).is_some() {
                self.duplicate_writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<(), StorageError> {
        self.lock().retain(|_, hit| hit.created_at >= cutoff);
        Ok(())
    }
}
