// ClickHouse Insert Builder - SQL builder pattern for batch hit inserts
//
// Builds a single multi-row INSERT with bound parameters. Type conversions
// (session id to hex, timestamp formatting) happen here so the Hit model stays
// storage-agnostic.

use clickhouse::Client;
use tracing::{debug, info};

use crate::models::hit::Hit;

/// Insert hits into the hits table
pub async fn insert_hits(
    client: &Client,
    table: &str,
    hits: &[Hit],
) -> Result<(), clickhouse::error::Error> {
    HitsInsertBuilder::new(client, table)
        .add_hits(hits)
        .execute()
        .await
}

/// Builder for hits table inserts
struct HitsInsertBuilder<'a> {
    client: &'a Client,
    table: String,
    hits: &'a [Hit],
}

impl<'a> HitsInsertBuilder<'a> {
    /// Column list, in bind order
    const INSERT_COLUMNS: &'static str =
        "hit_id, site, session, first_visit, path, title, referrer, ref_scheme, event, size, created_at";

    const COLUMN_COUNT: usize = 11;

    fn new(client: &'a Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            hits: &[],
        }
    }

    fn add_hits(mut self, hits: &'a [Hit]) -> Self {
        self.hits = hits;
        self
    }

    async fn execute(self) -> Result<(), clickhouse::error::Error> {
        if self.hits.is_empty() {
            debug!("No hits to insert");
            return Ok(());
        }

        let hit_count = self.hits.len();
        debug!("Building batch insert for {} hits to {}", hit_count, self.table);

        let query = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table,
            Self::INSERT_COLUMNS,
            values_placeholder(hit_count, Self::COLUMN_COUNT)
        );

        let mut query_builder = self.client.query(&query);
        for hit in self.hits {
            query_builder = bind_hit_params(query_builder, hit);
        }

        query_builder.execute().await?;

        info!("Inserted {} hits to {}", hit_count, self.table);
        Ok(())
    }
}

/// VALUES clause with `rows` groups of `columns` placeholders
fn values_placeholder(rows: usize, columns: usize) -> String {
    let single_row = format!("({})", vec!["?"; columns].join(", "));
    vec![single_row; rows].join(", ")
}

/// Screen size as stored: comma-separated, empty when unknown
fn format_size(size: &[f64]) -> String {
    size.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Bind parameters for a single hit, in the order of INSERT_COLUMNS
fn bind_hit_params(query: clickhouse::query::Query, hit: &Hit) -> clickhouse::query::Query {
    let timestamp = hit.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string();

    query
        .bind(hit.hit_id.to_string())
        .bind(hit.site.as_str())
        .bind(hit.session.to_string())
        .bind(hit.first_visit)
        .bind(hit.path.as_str())
        .bind(hit.title.as_str())
        .bind(hit.referrer.as_str())
        .bind(hit.ref_scheme.map(|scheme| scheme.as_str()).unwrap_or(""))
        .bind(hit.event)
        .bind(format_size(&hit.size))
        .bind(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_placeholder_generation() {
        let values = values_placeholder(3, HitsInsertBuilder::COLUMN_COUNT);

        assert_eq!(values.matches('?').count(), 33);
        assert_eq!(values.matches('(').count(), 3);
        assert!(values.starts_with("(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(&[40.0, 50.0, 1.5]), "40,50,1.5");
        assert_eq!(format_size(&[]), "");
    }

    #[test]
    fn test_column_count_matches_columns() {
        let columns = HitsInsertBuilder::INSERT_COLUMNS.split(',').count();
        assert_eq!(columns, HitsInsertBuilder::COLUMN_COUNT);
    }
}
