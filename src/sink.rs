//! Chunked writes of enriched batches.

use crate::record::EnrichedRecord;
use crate::store::TimeSeriesStore;
use std::sync::Arc;
use tracing::{error, info};

/// Result of handing one batch to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOutcome {
    pub written: usize,
    pub dropped: usize,
}

impl WriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.dropped == 0
    }
}

/// Writes enriched records in ascending time order, `batch_size` at a time.
///
/// The first failed chunk drops it and everything after it. Later chunks are
/// newer than the failed one, so writing them would move the output
/// watermark past records that never landed.
#[derive(Clone)]
pub struct BatchSink {
    store: Arc<dyn TimeSeriesStore>,
    batch_size: usize,
}

impl BatchSink {
    pub fn new(store: Arc<dyn TimeSeriesStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Never fails; failures are logged and reported in the outcome.
    pub async fn write(&self, output_stream: &str, mut records: Vec<EnrichedRecord>) -> WriteOutcome {
        if records.is_empty() {
            return WriteOutcome::default();
        }
        records.sort_by_key(|r| r.timestamp);

        let total = records.len();
        let mut written = 0;
        for chunk in records.chunks(self.batch_size) {
            if let Err(e) = self.store.write(chunk).await {
                error!(
                    output = output_stream,
                    records = total - written,
                    error = %e,
                    "write failed; dropping remaining batch until next cycle"
                );
                return WriteOutcome {
                    written,
                    dropped: total - written,
                };
            }
            written += chunk.len();
        }
        info!(output = output_stream, records = written, "wrote enriched records");
        WriteOutcome {
            written,
            dropped: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldMap, RawRecord};
    use crate::store::InMemoryStore;
    use chrono::{TimeZone, Utc};

    fn enriched(hour: u32) -> EnrichedRecord {
        let raw = RawRecord::new(Utc.with_ymd_and_hms(2024, 2, 1, hour, 0, 0).unwrap());
        EnrichedRecord::from_raw("Out", &raw, FieldMap::from([("v".to_string(), 1i64.into())]))
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = InMemoryStore::new();
        let sink = BatchSink::new(Arc::new(store.clone()), 10);
        assert_eq!(sink.write("Out", Vec::new()).await, WriteOutcome::default());
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_writes_in_chunks_ascending() {
        let store = InMemoryStore::new();
        let sink = BatchSink::new(Arc::new(store.clone()), 2);
        let outcome = sink
            .write("Out", vec![enriched(5), enriched(1), enriched(3), enriched(2), enriched(4)])
            .await;

        assert_eq!(outcome, WriteOutcome { written: 5, dropped: 0 });
        assert!(outcome.is_complete());
        assert_eq!(store.write_calls(), 3);
        let hours: Vec<u32> = store
            .records("Out")
            .await
            .iter()
            .map(|r| chrono::Timelike::hour(&r.timestamp))
            .collect();
        assert_eq!(hours, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let sink = BatchSink::new(Arc::new(InMemoryStore::new()), 0);
        assert_eq!(sink.batch_size(), 1);
    }
}
