// Session assignment
// Maps a (site, visitor fingerprint) pair onto a session id through a salted
// hash and a recency index, so repeat hits collapse into one visit

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::hit::SessionId;
use crate::services::salt::{Salt, SaltStore};
use crate::utils::fingerprint::Fingerprint;

/// Salted hash of (site, fingerprint); the only visitor key ever held in memory
type SessionKey = [u8; 32];

#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    session: SessionId,
    last_seen: DateTime<Utc>,
}

/// Recency index: salted visitor key -> last session and when it was seen.
///
/// Not synchronized on its own; the memstore keeps it under the same lock as
/// the hit buffer.
#[derive(Debug, Default)]
pub struct SessionIndex {
    entries: HashMap<SessionKey, SessionEntry>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Assigns session ids using the salt store
pub struct SessionAssigner {
    salts: Arc<SaltStore>,
    continuity_window: Duration,
}

impl SessionAssigner {
    pub fn new(salts: Arc<SaltStore>, continuity_window: Duration) -> Self {
        Self {
            salts,
            continuity_window,
        }
    }

    pub fn salts(&self) -> &Arc<SaltStore> {
        &self.salts
    }

    pub fn continuity_window(&self) -> Duration {
        self.continuity_window
    }

    /// Returns the session for this visitor and whether it was just opened.
    ///
    /// A recent entry under the current salt is reused. Failing that, a recent
    /// entry under the previous salt is reused and re-keyed under the current
    /// salt, so a rotation does not split an open session. Anything else opens
    /// a new session.
    pub fn assign(
        &self,
        index: &mut SessionIndex,
        site: &str,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> (SessionId, bool) {
        let (current, previous) = self.salts.get_salt();
        let key = session_key(&current, site, fingerprint);

        if let Some(entry) = index.entries.get_mut(&key) {
            if self.is_recent(entry.last_seen, now) {
                entry.last_seen = entry.last_seen.max(now);
                return (entry.session, false);
            }
        } else {
            let previous_key = session_key(&previous, site, fingerprint);
            let carried = index
                .entries
                .get(&previous_key)
                .copied()
                .filter(|entry| self.is_recent(entry.last_seen, now));

            if let Some(entry) = carried {
                index.entries.remove(&previous_key);
                index.entries.insert(
                    key,
                    SessionEntry {
                        session: entry.session,
                        last_seen: entry.last_seen.max(now),
                    },
                );
                return (entry.session, false);
            }
        }

        let session = mint_session(&key);
        index.entries.insert(
            key,
            SessionEntry {
                session,
                last_seen: now,
            },
        );
        (session, true)
    }

    /// Drop entries not seen within the continuity window; returns how many
    pub fn evict_expired(&self, index: &mut SessionIndex, now: DateTime<Utc>) -> usize {
        let before = index.entries.len();
        index
            .entries
            .retain(|_, entry| self.is_recent(entry.last_seen, now));
        before - index.entries.len()
    }

    fn is_recent(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - last_seen).to_std() {
            Ok(elapsed) => elapsed <= self.continuity_window,
            // Out-of-order timestamp: treat as seen just now
            Err(_) => true,
        }
    }
}

fn session_key(salt: &Salt, site: &str, fingerprint: &Fingerprint) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update((site.len() as u64).to_be_bytes());
    hasher.update(site.as_bytes());
    hasher.update(fingerprint.as_bytes());
    hasher.finalize().into()
}

/// New session ids mix the visitor key with fresh randomness, so a visitor
/// returning after the window never gets their old id back
fn mint_session(key: &SessionKey) -> SessionId {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);

    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(nonce);
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    SessionId::from_bytes(bytes)
}
