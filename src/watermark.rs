//! Resume points derived from the output streams themselves.

use crate::error::EnricherError;
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads the latest enriched timestamp per output stream. Nothing is cached:
/// every cycle asks the store again, so a restart resumes where the output
/// actually ends.
#[derive(Clone)]
pub struct WatermarkAccessor {
    store: Arc<dyn TimeSeriesStore>,
}

impl WatermarkAccessor {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// Latest timestamp in `output_stream`. A store error is logged and
    /// reported as absent, the same as an empty stream.
    pub async fn last_output_timestamp(&self, output_stream: &str) -> Option<DateTime<Utc>> {
        match self.store.latest_timestamp(output_stream).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(
                    output = output_stream,
                    error = %e,
                    "watermark query failed; falling back to initial lookback"
                );
                None
            }
        }
    }

    /// Exclusive lower bound for the next raw fetch.
    pub async fn resolve_start(
        &self,
        output_stream: &str,
        now: DateTime<Utc>,
        initial_lookback: Duration,
    ) -> Result<DateTime<Utc>, EnricherError> {
        if let Some(ts) = self.last_output_timestamp(output_stream).await {
            debug!(output = output_stream, watermark = %ts, "resuming after watermark");
            return Ok(ts);
        }
        let start = now.checked_sub_signed(initial_lookback).ok_or_else(|| {
            EnricherError::Watermark(format!(
                "lookback of {} days from {now} is out of range",
                initial_lookback.num_days()
            ))
        })?;
        debug!(output = output_stream, start = %start, "no watermark; using initial lookback");
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EnrichedRecord, FieldMap, RawRecord};
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_falls_back_to_lookback_when_empty() {
        let accessor = WatermarkAccessor::new(Arc::new(InMemoryStore::new()));
        assert_eq!(accessor.last_output_timestamp("Enriched").await, None);
        let start = accessor
            .resolve_start("Enriched", now(), Duration::days(30))
            .await
            .unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_uses_latest_output_timestamp() {
        let store = InMemoryStore::new();
        let t1 = Utc.with_ymd_and_hms(2024, 6, 20, 7, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 21, 7, 0, 0).unwrap();
        let fields = FieldMap::from([("x".to_string(), 1i64.into())]);
        store
            .write(&[
                EnrichedRecord::from_raw("Enriched", &RawRecord::new(t2), fields.clone()),
                EnrichedRecord::from_raw("Enriched", &RawRecord::new(t1), fields),
            ])
            .await
            .unwrap();

        let accessor = WatermarkAccessor::new(Arc::new(store));
        let start = accessor
            .resolve_start("Enriched", now(), Duration::days(30))
            .await
            .unwrap();
        assert_eq!(start, t2);
    }

    #[tokio::test]
    async fn test_out_of_range_lookback_is_an_error() {
        let accessor = WatermarkAccessor::new(Arc::new(InMemoryStore::new()));
        let result = accessor
            .resolve_start("Enriched", now(), Duration::days(1_000_000_000))
            .await;
        assert!(matches!(result, Err(EnricherError::Watermark(_))));
    }
}
