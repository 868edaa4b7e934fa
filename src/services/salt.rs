// Session salt store
// Holds the current and previous hashing salts and rotates them on a fixed cadence

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::info;

/// Salt length in bytes (256 bits of entropy)
pub const SALT_LEN: usize = 32;

/// Secret salt mixed into session hashes
#[derive(Clone, PartialEq, Eq)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    /// Draw a fresh salt from the OS random source
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(<redacted>)")
    }
}

struct SaltState {
    current: Salt,
    previous: Salt,
    last_rotated: DateTime<Utc>,
}

/// Current/previous salt pair with interval-gated rotation
pub struct SaltStore {
    rotation_interval: Duration,
    state: RwLock<SaltState>,
}

impl SaltStore {
    pub fn new(rotation_interval: Duration) -> Self {
        Self::new_at(rotation_interval, Utc::now())
    }

    /// Create a store whose rotation clock starts at `now`
    pub fn new_at(rotation_interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            rotation_interval,
            state: RwLock::new(SaltState {
                current: Salt::generate(),
                previous: Salt::generate(),
                last_rotated: now,
            }),
        }
    }

    /// Snapshot of (current, previous)
    pub fn get_salt(&self) -> (Salt, Salt) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.current.clone(), state.previous.clone())
    }

    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    pub fn last_rotated(&self) -> DateTime<Utc> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_rotated
    }

    pub fn refresh_salt(&self) -> bool {
        self.refresh_salt_at(Utc::now())
    }

    /// Rotate current into previous if a full interval has passed since the
    /// last rotation. Returns whether a rotation happened.
    pub fn refresh_salt_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let due = (now - state.last_rotated)
            .to_std()
            .map(|elapsed| elapsed >= self.rotation_interval)
            .unwrap_or(false);
        if !due {
            return false;
        }

        let fresh = Salt::generate();
        state.previous = std::mem::replace(&mut state.current, fresh);
        state.last_rotated = now;

        info!("Session salt rotated");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 6, 18, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_generated_salts_differ() {
        assert_ne!(Salt::generate(), Salt::generate());
    }

    #[test]
    fn test_no_rotation_before_interval() {
        let store = SaltStore::new_at(Duration::from_secs(3600), start());
        let before = store.get_salt();

        assert!(!store.refresh_salt_at(start() + chrono::Duration::minutes(59)));
        assert_eq!(store.get_salt(), before);
    }

    #[test]
    fn test_rotation_moves_current_to_previous() {
        let store = SaltStore::new_at(Duration::from_secs(3600), start());
        let (current, _) = store.get_salt();

        let at = start() + chrono::Duration::hours(1);
        assert!(store.refresh_salt_at(at));

        let (new_current, previous) = store.get_salt();
        assert_eq!(previous, current);
        assert_ne!(new_current, current);
        assert_eq!(store.last_rotated(), at);
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let store = SaltStore::new_at(Duration::from_secs(60), start());
        assert!(!store.refresh_salt_at(start() - chrono::Duration::hours(5)));
    }

    #[test]
    fn test_salt_debug_is_redacted() {
        let rendered = format!("{:?}", Salt::generate());
        assert_eq!(rendered, "Salt(<redacted>)");
    }
}
