use crate::error::StoreError;
use crate::record::{EnrichedRecord, RawRecord};
use crate::store::TimeSeriesStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-process time-series store.
///
/// Each stream is kept sorted by timestamp. Inserting a record whose
/// timestamp and tag set already exist merges its fields over the stored
/// ones, the same point-overwrite rule InfluxDB applies.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    streams: Arc<Mutex<HashMap<String, Vec<RawRecord>>>>,
    write_calls: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, stream: &str, record: RawRecord) {
        let mut streams = self.streams.lock().await;
        Self::insert_sorted(streams.entry(stream.to_string()).or_default(), record);
    }

    pub async fn insert_all(&self, stream: &str, records: impl IntoIterator<Item = RawRecord>) {
        let mut streams = self.streams.lock().await;
        let rows = streams.entry(stream.to_string()).or_default();
        for record in records {
            Self::insert_sorted(rows, record);
        }
    }

    /// Snapshot of a stream, ascending.
    pub async fn records(&self, stream: &str) -> Vec<RawRecord> {
        self.streams
            .lock()
            .await
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `write` calls received so far.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn insert_sorted(rows: &mut Vec<RawRecord>, record: RawRecord) {
        if let Some(existing) = rows
            .iter_mut()
            .find(|r| r.timestamp == record.timestamp && r.tags == record.tags)
        {
            existing.fields.extend(record.fields);
            return;
        }
        let pos = rows.partition_point(|r| r.timestamp <= record.timestamp);
        rows.insert(pos, record);
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn query_since(
        &self,
        stream: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(stream)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.timestamp > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_before(
        &self,
        stream: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let streams = self.streams.lock().await;
        let Some(rows) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let end = rows.partition_point(|r| r.timestamp < before);
        let start = end.saturating_sub(limit);
        Ok(rows[start..end].to_vec())
    }

    async fn latest_timestamp(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(stream)
            .and_then(|rows| rows.last())
            .map(|r| r.timestamp))
    }

    async fn write(&self, records: &[EnrichedRecord]) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut streams = self.streams.lock().await;
        for record in records {
            Self::insert_sorted(
                streams.entry(record.output_stream.clone()).or_default(),
                record.to_raw(),
            );
        }
        Ok(())
    }
}
