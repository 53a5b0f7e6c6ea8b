#[cfg(test)]
mod tests {
    use crate::calculators::{Calculator, EnrichContext};
    use crate::engine::{EngineState, PollingEngine, PollingOptions};
    use crate::error::{CalculatorError, EnricherError, StoreError};
    use crate::record::{EnrichedRecord, FieldMap, FieldValue, RawRecord};
    use crate::registry::EnrichmentRegistry;
    use crate::sink::{BatchSink, WriteOutcome};
    use crate::store::{InMemoryStore, TimeSeriesStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use mockall::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    mock! {
        pub Store {}
        #[async_trait]
        impl TimeSeriesStore for Store {
            async fn ping(&self) -> Result<(), StoreError>;
            async fn query_since(
                &self,
                stream: &str,
                after: DateTime<Utc>,
            ) -> Result<Vec<RawRecord>, StoreError>;
            async fn query_before(
                &self,
                stream: &str,
                before: DateTime<Utc>,
                limit: usize,
            ) -> Result<Vec<RawRecord>, StoreError>;
            async fn latest_timestamp(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
            async fn write(&self, records: &[EnrichedRecord]) -> Result<(), StoreError>;
            async fn ensure_output_database(&self) -> Result<(), StoreError>;
        }
    }

    /// Emits one fixed field.
    struct Constant {
        input: &'static str,
        output: &'static str,
        field: &'static str,
        value: i64,
    }

    #[async_trait]
    impl Calculator for Constant {
        fn name(&self) -> &str {
            self.field
        }

        fn input_stream(&self) -> Option<&str> {
            Some(self.input)
        }

        fn output_stream(&self) -> Option<&str> {
            Some(self.output)
        }

        async fn enrich(
            &self,
            _record: &RawRecord,
            _ctx: &EnrichContext,
        ) -> Result<Option<FieldMap>, CalculatorError> {
            Ok(Some(FieldMap::from([(
                self.field.to_string(),
                FieldValue::Integer(self.value),
            )])))
        }
    }

    /// Fails every record, either by error or by panic.
    struct Broken {
        panics: bool,
    }

    #[async_trait]
    impl Calculator for Broken {
        fn name(&self) -> &str {
            if self.panics {
                "panicking"
            } else {
                "failing"
            }
        }

        fn input_stream(&self) -> Option<&str> {
            Some("Sleep")
        }

        fn output_stream(&self) -> Option<&str> {
            Some("EnrichedSleep")
        }

        async fn enrich(
            &self,
            _record: &RawRecord,
            _ctx: &EnrichContext,
        ) -> Result<Option<FieldMap>, CalculatorError> {
            if self.panics {
                panic!("index out of range in reference table");
            }
            Err(CalculatorError::Calculation("division by zero".into()))
        }
    }

    /// Panics on the first watermark query, then behaves like the inner store.
    /// Every watermark query is timestamped on the tokio clock.
    struct PanicOnce {
        inner: InMemoryStore,
        watermark_reads: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl TimeSeriesStore for PanicOnce {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn query_since(
            &self,
            stream: &str,
            after: DateTime<Utc>,
        ) -> Result<Vec<RawRecord>, StoreError> {
            self.inner.query_since(stream, after).await
        }

        async fn query_before(
            &self,
            stream: &str,
            before: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<RawRecord>, StoreError> {
            self.inner.query_before(stream, before, limit).await
        }

        async fn latest_timestamp(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
            let first = {
                let mut reads = self.watermark_reads.lock().unwrap();
                reads.push(Instant::now());
                reads.len() == 1
            };
            if first {
                panic!("connection pool poisoned");
            }
            self.inner.latest_timestamp(stream).await
        }

        async fn write(&self, records: &[EnrichedRecord]) -> Result<(), StoreError> {
            self.inner.write(records).await
        }
    }

    fn constant(input: &'static str, output: &'static str, field: &'static str) -> Box<dyn Calculator> {
        Box::new(Constant {
            input,
            output,
            field,
            value: 1,
        })
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, day, 7, 0, 0).unwrap()
    }

    fn server_error() -> StoreError {
        StoreError::Status {
            status: 503,
            body: "service unavailable".into(),
        }
    }

    fn engine(
        calculators: Vec<Box<dyn Calculator>>,
        store: Arc<dyn TimeSeriesStore>,
        options: PollingOptions,
    ) -> PollingEngine {
        PollingEngine::new(EnrichmentRegistry::from_calculators(calculators), store, options).unwrap()
    }

    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_read_failure_skips_only_that_stream() {
        let mut store = MockStore::new();
        store.expect_latest_timestamp().returning(|_| Ok(None));
        store.expect_query_since().returning(|stream, _| match stream {
            "Sleep" => Err(StoreError::Query("measurement scan failed".into())),
            _ => Ok(vec![RawRecord::new(at(2))]),
        });
        store
            .expect_write()
            .times(1)
            .returning(|records| {
                assert!(records.iter().all(|r| r.output_stream == "EnrichedVO2"));
                Ok(())
            });

        let engine = engine(
            vec![
                constant("Sleep", "EnrichedSleep", "a"),
                constant("VO2", "EnrichedVO2", "b"),
            ],
            Arc::new(store),
            PollingOptions::default(),
        );
        let report = assert_ok!(engine.run_cycle(&running()).await);

        let sleep = report.stream("Sleep").unwrap();
        assert!(sleep.read_failed);
        assert_eq!(sleep.written, 0);
        assert_eq!(report.stream("VO2").unwrap().written, 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_refetched_next_cycle() {
        let records = vec![RawRecord::new(at(1)), RawRecord::new(at(2))];
        let writes = Arc::new(AtomicUsize::new(0));

        let mut store = MockStore::new();
        // The failed write leaves the output empty, so both cycles start from the lookback.
        store.expect_latest_timestamp().times(2).returning(|_| Ok(None));
        store
            .expect_query_since()
            .times(2)
            .returning(move |_, _| Ok(records.clone()));
        let counter = writes.clone();
        store.expect_write().times(2).returning(move |batch| {
            assert_eq!(batch.len(), 2);
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(server_error())
            } else {
                Ok(())
            }
        });

        let engine = engine(
            vec![constant("Sleep", "EnrichedSleep", "a")],
            Arc::new(store),
            PollingOptions::default(),
        );

        let first = assert_ok!(engine.run_cycle(&running()).await);
        let stream = first.stream("Sleep").unwrap();
        assert_eq!((stream.written, stream.dropped), (0, 2));

        let second = assert_ok!(engine.run_cycle(&running()).await);
        assert_eq!(second.written(), 2);
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sink_stops_at_first_failed_chunk() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut store = MockStore::new();
        store.expect_write().times(2).returning(move |chunk| {
            assert_eq!(chunk.len(), 1);
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                Err(server_error())
            }
        });

        let sink = BatchSink::new(Arc::new(store), 1);
        let batch = (1..=3)
            .map(|d| EnrichedRecord::from_raw("Out", &RawRecord::new(at(d)), FieldMap::new()))
            .collect();
        let outcome = sink.write("Out", batch).await;
        assert_eq!(outcome, WriteOutcome { written: 1, dropped: 2 });
        assert!(!outcome.is_complete());
    }

    #[tokio::test]
    async fn test_empty_fetch_makes_no_write() {
        let mut store = MockStore::new();
        store.expect_latest_timestamp().returning(|_| Ok(Some(at(5))));
        store
            .expect_query_since()
            .times(1)
            .returning(|_, after| {
                assert_eq!(after, at(5));
                Ok(Vec::new())
            });
        store.expect_write().never();

        let engine = engine(
            vec![constant("Sleep", "EnrichedSleep", "a")],
            Arc::new(store),
            PollingOptions::default(),
        );
        let report = assert_ok!(engine.run_cycle(&running()).await);
        assert_eq!(report.fetched(), 0);
    }

    #[tokio::test]
    async fn test_watermark_error_falls_back_to_lookback() {
        let mut store = MockStore::new();
        store
            .expect_latest_timestamp()
            .returning(|_| Err(StoreError::Decode("unexpected payload".into())));
        store.expect_query_since().times(1).returning(|_, after| {
            let lookback = Utc::now() - after;
            assert!((lookback - Duration::days(7)).num_seconds().abs() < 60);
            Ok(Vec::new())
        });
        store.expect_write().never();

        let options = PollingOptions {
            initial_lookback: Duration::days(7),
            ..PollingOptions::default()
        };
        let engine = engine(
            vec![constant("Sleep", "EnrichedSleep", "a")],
            Arc::new(store),
            options,
        );
        assert_ok!(engine.run_cycle(&running()).await);
    }

    #[tokio::test]
    async fn test_broken_calculators_do_not_block_siblings() {
        let store = InMemoryStore::new();
        store
            .insert_all("Sleep", vec![RawRecord::new(Utc::now() - Duration::days(1))])
            .await;

        let engine = engine(
            vec![
                Box::new(Broken { panics: true }) as Box<dyn Calculator>,
                constant("Sleep", "EnrichedSleep", "a"),
                Box::new(Broken { panics: false }),
                constant("Sleep", "EnrichedSleep", "b"),
            ],
            Arc::new(store.clone()),
            PollingOptions::default(),
        );
        let report = assert_ok!(engine.run_cycle(&running()).await);
        let stream = report.stream("Sleep").unwrap();
        assert_eq!(stream.calculator_failures, 2);
        assert_eq!(stream.written, 1);

        let out = store.records("EnrichedSleep").await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields.len(), 2);
        assert_eq!(out[0].fields["a"], FieldValue::Integer(1));
        assert_eq!(out[0].fields["b"], FieldValue::Integer(1));
    }

    #[tokio::test]
    async fn test_later_calculator_wins_field_clash() {
        let store = InMemoryStore::new();
        store
            .insert("Sleep", RawRecord::new(Utc::now() - Duration::days(1)))
            .await;
        let engine = engine(
            vec![
                Box::new(Constant {
                    input: "Sleep",
                    output: "EnrichedSleep",
                    field: "score",
                    value: 1,
                }) as Box<dyn Calculator>,
                Box::new(Constant {
                    input: "Sleep",
                    output: "EnrichedSleep",
                    field: "score",
                    value: 2,
                }),
            ],
            Arc::new(store.clone()),
            PollingOptions::default(),
        );
        assert_ok!(engine.run_cycle(&running()).await);
        let out = store.records("EnrichedSleep").await;
        assert_eq!(out[0].fields["score"], FieldValue::Integer(2));
    }

    #[tokio::test]
    async fn test_unresolvable_watermark_fails_the_cycle() {
        let options = PollingOptions {
            initial_lookback: Duration::days(1_000_000_000),
            ..PollingOptions::default()
        };
        let engine = engine(
            vec![constant("Sleep", "EnrichedSleep", "a")],
            Arc::new(InMemoryStore::new()),
            options,
        );
        let err = assert_err!(engine.run_cycle(&running()).await);
        assert!(matches!(err, EnricherError::Watermark(_)));
    }

    #[tokio::test]
    async fn test_run_recovers_from_panicking_cycle() {
        let reads = Arc::new(Mutex::new(Vec::new()));
        let store = PanicOnce {
            inner: InMemoryStore::new(),
            watermark_reads: reads.clone(),
        };
        let options = PollingOptions {
            poll_interval: std::time::Duration::from_millis(5),
            recovery_delay: std::time::Duration::from_millis(10),
            ..PollingOptions::default()
        };
        let engine = engine(
            vec![constant("Sleep", "EnrichedSleep", "a")],
            Arc::new(store),
            options,
        );

        let (tx, rx) = watch::channel(false);
        let stop = async move {
            while reads.lock().unwrap().len() < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            tx.send(true).unwrap();
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            tokio::join!(engine.run(rx), stop);
        })
        .await
        .expect("engine did not stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_waits_recovery_delay_not_poll_interval() {
        let poll_interval = std::time::Duration::from_secs(5);
        let recovery_delay = std::time::Duration::from_secs(60);
        let reads = Arc::new(Mutex::new(Vec::new()));
        let store = PanicOnce {
            inner: InMemoryStore::new(),
            watermark_reads: reads.clone(),
        };
        let engine = engine(
            vec![constant("Sleep", "EnrichedSleep", "a")],
            Arc::new(store),
            PollingOptions {
                poll_interval,
                recovery_delay,
                ..PollingOptions::default()
            },
        );
        let mut transitions = engine.transitions();

        let (tx, rx) = watch::channel(false);
        let watched = reads.clone();
        let stop = async move {
            while watched.lock().unwrap().len() < 3 {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            tx.send(true).unwrap();
        };
        tokio::join!(engine.run(rx), stop);

        // Read 1 panics; read 2 follows the recovery delay, read 3 the poll interval.
        let reads = reads.lock().unwrap().clone();
        let after_failure = reads[1] - reads[0];
        let after_success = reads[2] - reads[1];
        assert!(after_failure >= recovery_delay, "{after_failure:?}");
        assert!(after_failure < recovery_delay + poll_interval, "{after_failure:?}");
        assert!(after_success >= poll_interval, "{after_success:?}");
        assert!(after_success < recovery_delay, "{after_success:?}");

        let mut states = Vec::new();
        while let Ok(state) = transitions.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states[..6],
            [
                EngineState::FetchingWatermark,
                EngineState::FailedCycle,
                EngineState::Sleeping,
                EngineState::FetchingWatermark,
                EngineState::FetchingRaw,
                EngineState::Sleeping,
            ]
        );
        assert_eq!(states.last(), Some(&EngineState::Idle));
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
