pub mod hit;

pub use hit::{Hit, HitMetadata, RefScheme, SessionId};
