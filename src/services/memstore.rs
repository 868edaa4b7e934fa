// In-memory hit store
// Buffers incoming hits with their session ids and hands them to storage in batches

use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use tracing::{debug, error, info};

use crate::db::{HitStorage, StorageError};
use crate::models::hit::{Hit, HitMetadata, SessionId};
use crate::services::persist_runner::PersistRunner;
use crate::services::session::{SessionAssigner, SessionIndex};
use crate::utils::fingerprint::Fingerprint;

/// Everything guarded by the memstore lock
#[derive(Default)]
struct Buffers {
    hits: Vec<Hit>,
    sessions: SessionIndex,
}

/// Hit buffer plus session recency index.
///
/// A single mutex covers both, held only for the in-memory mutation; storage
/// I/O always runs on a drained, private batch.
pub struct Memstore {
    buffers: Mutex<Buffers>,
    assigner: SessionAssigner,
    storage: Arc<dyn HitStorage>,
    runner: Option<PersistRunner>,
    persist_watermark: usize,
    // Cleared once the watermark has signalled; re-armed by a successful drain
    watermark_armed: AtomicBool,
}

impl Memstore {
    pub fn new(assigner: SessionAssigner, storage: Arc<dyn HitStorage>) -> Self {
        Self {
            buffers: Mutex::new(Buffers::default()),
            assigner,
            storage,
            runner: None,
            persist_watermark: usize::MAX,
            watermark_armed: AtomicBool::new(true),
        }
    }

    /// Ask `runner` for an immediate persist when the buffer reaches
    /// `watermark` hits. One request per crossing; after a failed drain no
    /// further requests are made until a drain succeeds, so retries follow the
    /// persist task's own period.
    pub fn with_persist_runner(mut self, runner: PersistRunner, watermark: usize) -> Self {
        self.runner = Some(runner);
        self.persist_watermark = watermark.max(1);
        self
    }

    pub fn assigner(&self) -> &SessionAssigner {
        &self.assigner
    }

    /// Ingestion entry point: assign a session and buffer the hit.
    /// Never fails; persistence happens in the background.
    pub fn record_hit(
        &self,
        site: &str,
        fingerprint: &Fingerprint,
        metadata: HitMetadata,
        now: DateTime<Utc>,
    ) -> SessionId {
        let (session, buffered) = {
            let mut buffers = self.lock();
            let Buffers { hits, sessions } = &mut *buffers;

            let (session, first_visit) = self.assigner.assign(sessions, site, fingerprint, now);
            hits.push(Hit::new(site, session, first_visit, metadata, now));
            (session, hits.len())
        };

        self.check_watermark(buffered);
        session
    }

    /// Buffer an already-tagged hit
    pub fn append(&self, hit: Hit) {
        let buffered = {
            let mut buffers = self.lock();
            buffers.hits.push(hit);
            buffers.hits.len()
        };

        self.check_watermark(buffered);
    }

    pub fn len(&self) -> usize {
        self.lock().hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().hits.is_empty()
    }

    /// Copy of the buffered hits, oldest first
    pub fn pending_hits(&self) -> Vec<Hit> {
        self.lock().hits.clone()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Swap the buffer for an empty one and persist the swapped-out batch.
    ///
    /// On failure the batch goes back to the front of the buffer, ahead of
    /// anything appended meanwhile, and the error is returned. Storage upserts
    /// on hit id, so a retried batch cannot double count.
    pub async fn drain_and_persist(&self) -> Result<usize, StorageError> {
        let batch = std::mem::take(&mut self.lock().hits);
        if batch.is_empty() {
            self.watermark_armed.store(true, Ordering::SeqCst);
            return Ok(0);
        }

        let count = batch.len();
        debug!("Persisting {} hits", count);

        match self.storage.persist(&batch).await {
            Ok(()) => {
                info!("Persisted {} hits", count);
                self.watermark_armed.store(true, Ordering::SeqCst);
                let buffered = self.len();
                self.check_watermark(buffered);
                Ok(count)
            },
            Err(e) => {
                self.watermark_armed.store(false, Ordering::SeqCst);
                let mut buffers = self.lock();
                buffers.hits.splice(0..0, batch);
                error!(
                    "Failed to persist {} hits, re-queued ({} buffered): {}",
                    count,
                    buffers.hits.len(),
                    e
                );
                Err(e)
            },
        }
    }

    /// Rotate the salt if due and forget sessions that fell out of the
    /// continuity window. Returns the number of evicted sessions.
    pub fn cycle_sessions(&self, now: DateTime<Utc>) -> usize {
        self.assigner.salts().refresh_salt_at(now);

        let mut buffers = self.lock();
        let evicted = self.assigner.evict_expired(&mut buffers.sessions, now);
        if evicted > 0 {
            debug!(
                "Evicted {} expired sessions, {} remain",
                evicted,
                buffers.sessions.len()
            );
        }
        evicted
    }

    fn check_watermark(&self, buffered: usize) {
        let Some(runner) = &self.runner else {
            return;
        };
        if buffered < self.persist_watermark {
            return;
        }
        if self.watermark_armed.swap(false, Ordering::SeqCst) {
            runner.run();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryHitStorage;
    use crate::services::salt::SaltStore;
    use crate::services::persist_runner::PersistSignals;
    use std::time::Duration;

    fn memstore(storage: Arc<MemoryHitStorage>) -> Memstore {
        let salts = Arc::new(SaltStore::new(Duration::from_secs(3600)));
        Memstore::new(SessionAssigner::new(salts, Duration::from_secs(3600)), storage)
    }

    fn meta(path: &str) -> HitMetadata {
        HitMetadata {
            path: path.to_string(),
            ..HitMetadata::default()
        }
    }

    #[tokio::test]
    async fn test_drain_empty_buffer() {
        let storage = Arc::new(MemoryHitStorage::new());
        let store = memstore(storage.clone());

        assert_eq!(store.drain_and_persist().await.unwrap(), 0);
        assert_eq!(storage.persist_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_goes_before_new_hits() {
        let storage = Arc::new(MemoryHitStorage::new());
        let store = memstore(storage.clone());
        let fp = Fingerprint::from_bytes([9; 32]);

        store.record_hit("example.com", &fp, meta("/a"), Utc::now());
        store.record_hit("example.com", &fp, meta("/b"), Utc::now());
        storage.fail_next(1);

        assert!(store.drain_and_persist().await.is_err());
        store.record_hit("example.com", &fp, meta("/c"), Utc::now());

        let paths: Vec<String> = store.pending_hits().into_iter().map(|h| h.path).collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn test_watermark_fires_runner() {
        let storage = Arc::new(MemoryHitStorage::new());
        let (runner, mut signals) = PersistRunner::new();
        let store = memstore(storage).with_persist_runner(runner, 2);
        let fp = Fingerprint::from_bytes([4; 32]);

        store.record_hit("example.com", &fp, meta("/a"), Utc::now());
        assert!(
            tokio::time::timeout(Duration::from_millis(10), signals.recv())
                .await
                .is_err(),
            "below watermark nothing is signalled"
        );

        store.record_hit("example.com", &fp, meta("/b"), Utc::now());
        assert_eq!(signals.recv().await, Some(()));
    }

    async fn no_signal(signals: &mut PersistSignals) -> bool {
        tokio::time::timeout(Duration::from_millis(10), signals.recv())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_watermark_signals_once_per_crossing() {
        let storage = Arc::new(MemoryHitStorage::new());
        let (runner, mut signals) = PersistRunner::new();
        let store = memstore(storage).with_persist_runner(runner, 2);
        let fp = Fingerprint::from_bytes([5; 32]);

        for path in ["/a", "/b", "/c", "/d"] {
            store.record_hit("example.com", &fp, meta(path), Utc::now());
        }
        assert_eq!(signals.recv().await, Some(()));
        assert!(no_signal(&mut signals).await, "already above the watermark");

        assert_eq!(store.drain_and_persist().await.unwrap(), 4);
        store.record_hit("example.com", &fp, meta("/e"), Utc::now());
        store.record_hit("example.com", &fp, meta("/f"), Utc::now());
        assert_eq!(signals.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_failed_drain_silences_watermark_until_success() {
        let storage = Arc::new(MemoryHitStorage::new());
        let (runner, mut signals) = PersistRunner::new();
        let store = memstore(storage.clone()).with_persist_runner(runner, 2);
        let fp = Fingerprint::from_bytes([6; 32]);

        store.record_hit("example.com", &fp, meta("/a"), Utc::now());
        store.record_hit("example.com", &fp, meta("/b"), Utc::now());
        assert_eq!(signals.recv().await, Some(()));

        storage.fail_next(1);
        assert!(store.drain_and_persist().await.is_err());
        for path in ["/c", "/d", "/e"] {
            store.record_hit("example.com", &fp, meta(path), Utc::now());
        }
        assert!(no_signal(&mut signals).await, "retry waits for the timer");

        assert_eq!(store.drain_and_persist().await.unwrap(), 5);
        store.record_hit("example.com", &fp, meta("/f"), Utc::now());
        store.record_hit("example.com", &fp, meta("/g"), Utc::now());
        assert_eq!(signals.recv().await, Some(()));
    }
}
