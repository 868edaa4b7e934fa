// Utility modules for the hit collector

pub mod fingerprint;
pub mod service_error;

pub use fingerprint::Fingerprint;
pub use service_error::ServiceError;
