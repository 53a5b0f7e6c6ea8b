//! Time-series store access.
//!
//! The enrichment engine only ever talks to the database through the
//! [`TimeSeriesStore`] trait:
//! - `influx`: InfluxDB over its InfluxQL `/query` and line-protocol `/write` endpoints
//! - `memory`: in-process store with the same ordering and overwrite rules
//!
//! Implementations must return records in ascending time order and treat a
//! write of an existing timestamp + tag set as an overwrite; the engine relies
//! on that to re-enrich a window safely after a partial write.

pub mod influx;
pub mod memory;

use crate::error::StoreError;
use crate::record::{EnrichedRecord, RawRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use influx::InfluxStore;
pub use memory::InMemoryStore;

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// All records of `stream` with `timestamp > after`, ascending.
    async fn query_since(
        &self,
        stream: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, StoreError>;

    /// The last `limit` records of `stream` with `timestamp < before`, ascending.
    async fn query_before(
        &self,
        stream: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError>;

    /// Timestamp of the most recent record in an output stream.
    async fn latest_timestamp(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Write a batch of enriched records to their output streams.
    async fn write(&self, records: &[EnrichedRecord]) -> Result<(), StoreError>;

    /// Create the output database if the backend supports it.
    async fn ensure_output_database(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
