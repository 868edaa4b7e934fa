// Pageview hit model
// A hit is tagged with its session once, at ingestion, and never re-tagged

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// SESSION IDENTIFIER
// =============================================================================

/// 128-bit session identifier stored as two 64-bit halves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub hi: u64,
    pub lo: u64,
}

impl SessionId {
    /// Build a session id from the first 16 bytes of a digest
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..]);

        Self {
            hi: u64::from_be_bytes(hi),
            lo: u64::from_be_bytes(lo),
        }
    }

    pub fn as_u128(&self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

// =============================================================================
// HIT
// =============================================================================

/// Where a referrer value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefScheme {
    /// A URL referrer
    Http,
    /// Free-form text that is not a URL
    Other,
    /// Campaign parameter (`ref=`) from the page query
    Campaign,
}

impl RefScheme {
    /// Single-letter storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            RefScheme::Http => "h",
            RefScheme::Other => "o",
            RefScheme::Campaign => "c",
        }
    }
}

/// Request-derived fields handed over by the HTTP layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HitMetadata {
    pub path: String,
    pub title: String,
    pub referrer: String,
    pub ref_scheme: Option<RefScheme>,
    pub event: bool,
    /// Screen width, height and pixel ratio, when reported
    pub size: Vec<f64>,
}

/// One buffered pageview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Stable identity; storage upserts on it so re-queued batches are harmless
    pub hit_id: Uuid,
    pub site: String,
    pub session: SessionId,
    pub first_visit: bool,
    pub path: String,
    pub title: String,
    pub referrer: String,
    pub ref_scheme: Option<RefScheme>,
    pub event: bool,
    pub size: Vec<f64>,
    pub created_at: DateTime<Utc>,
}

impl Hit {
    pub fn new(
        site: &str,
        session: SessionId,
        first_visit: bool,
        metadata: HitMetadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            hit_id: Uuid::new_v4(),
            site: site.to_string(),
            session,
            first_visit,
            path: metadata.path,
            title: metadata.title,
            referrer: metadata.referrer,
            ref_scheme: metadata.ref_scheme,
            event: metadata.event,
            size: metadata.size,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_halves() {
        let mut bytes = [0u8; 16];
        bytes[7] = 1;
        bytes[15] = 2;

        let id = SessionId::from_bytes(bytes);
        assert_eq!(id.hi, 1);
        assert_eq!(id.lo, 2);
        assert_eq!(id.as_u128(), (1u128 << 64) | 2);
        assert_eq!(id.to_string(), "00000000000000010000000000000002");
    }

    #[test]
    fn test_hits_get_distinct_ids() {
        let session = SessionId { hi: 1, lo: 1 };
        let a = Hit::new("example.com", session, true, HitMetadata::default(), Utc::now());
        let b = Hit::new("example.com", session, false, HitMetadata::default(), Utc::now());
        assert_ne!(a.hit_id, b.hit_id);
    }
}
