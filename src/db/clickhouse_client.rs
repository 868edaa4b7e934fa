// ClickHouse client configuration and connection management
// Centralizes ClickHouse authentication, schema setup and the hit storage impl

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Client;
use tracing::info;

use super::storage::{HitStorage, StorageError};
use crate::app_config::ClickHouseConfig;
use crate::models::hit::Hit;

/// Table holding persisted hits
pub const HITS_TABLE: &str = "hits";

/// ClickHouse client wrapper with proper authentication
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    database: String,
}

impl ClickHouseClient {
    pub fn new(config: &ClickHouseConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_user(&config.user)
            .with_password(&config.password);

        info!(
            "ClickHouse client initialized for database: {}",
            config.database
        );

        Self {
            client,
            database: config.database.clone(),
        }
    }

    /// Create a client from the global app configuration
    pub fn from_config() -> Self {
        Self::new(&crate::app_config::config().clickhouse)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub async fn health_check(&self) -> Result<(), clickhouse::error::Error> {
        self.client.query("SELECT 1").fetch_one::<u8>().await?;
        Ok(())
    }

    /// Create the hits table if it does not exist yet.
    ///
    /// ReplacingMergeTree collapses rows sharing the sort key, which makes a
    /// re-sent batch an upsert.
    pub async fn ensure_schema(&self) -> Result<(), clickhouse::error::Error> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                 hit_id UUID, \
                 site LowCardinality(String), \
                 session FixedString(32), \
                 first_visit Bool, \
                 path String, \
                 title String, \
                 referrer String, \
                 ref_scheme LowCardinality(String), \
                 event Bool, \
                 size String, \
                 created_at DateTime64(3, 'UTC')\
             ) ENGINE = ReplacingMergeTree \
             PARTITION BY toYYYYMM(created_at) \
             ORDER BY (site, created_at, hit_id)",
            self.table(HITS_TABLE)
        );

        self.client.query(&ddl).execute().await?;
        info!("Ensured ClickHouse table {}", self.table(HITS_TABLE));
        Ok(())
    }

    /// Insert hits into the given table (with or without database prefix)
    pub async fn insert_hits(
        &self,
        table: &str,
        hits: &[Hit],
    ) -> Result<(), clickhouse::error::Error> {
        crate::db::insert_hits(&self.client, &self.table(table), hits).await
    }

    fn table(&self, table: &str) -> String {
        if table.contains('.') {
            table.to_string()
        } else {
            format!("{}.{}", self.database, table)
        }
    }
}

#[async_trait]
impl HitStorage for ClickHouseClient {
    async fn persist(&self, batch: &[Hit]) -> Result<(), StorageError> {
        self.insert_hits(HITS_TABLE, batch).await?;
        Ok(())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<(), StorageError> {
        let query = format!(
            "ALTER TABLE {} DELETE WHERE created_at < toDateTime64(?, 3, 'UTC')",
            self.table(HITS_TABLE)
        );
        let cutoff = cutoff.format("%Y-%m-%d %H:%M:%S%.3f").to_string();

        self.client.query(&query).bind(cutoff).execute().await?;
        Ok(())
    }
}
