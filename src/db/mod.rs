// Storage layer: the hit storage boundary and its implementations

pub mod clickhouse_client;
pub mod clickhouse_insert_builder;
pub mod memory;
pub mod storage;

pub use clickhouse_client::{ClickHouseClient, HITS_TABLE};
pub use clickhouse_insert_builder::insert_hits;
pub use memory::MemoryHitStorage;
pub use storage::{HitStorage, StorageError};
