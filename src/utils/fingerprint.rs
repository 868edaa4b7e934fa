// Visitor fingerprinting
// Derives an opaque visitor identifier so the raw address never reaches the store

use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Opaque visitor fingerprint (SHA-256 of client characteristics)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Derive a fingerprint from the user agent and client address
    pub fn from_request(user_agent: &str, ip: IpAddr) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user_agent.as_bytes());
        hasher.update([0u8]);
        hasher.update(ip.to_string().as_bytes());

        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_fingerprint_consistency() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let a = Fingerprint::from_request("Chrome/120.0", ip);
        let b = Fingerprint::from_request("Chrome/120.0", ip);
        assert_eq!(a, b, "Same inputs should produce same fingerprint");
    }

    #[test]
    fn test_fingerprint_varies_with_inputs() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let other_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        let base = Fingerprint::from_request("Chrome/120.0", ip);
        assert_ne!(base, Fingerprint::from_request("Firefox/121.0", ip));
        assert_ne!(base, Fingerprint::from_request("Chrome/120.0", other_ip));
    }
}
