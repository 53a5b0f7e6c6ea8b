//! Watermark-driven polling loop.
//!
//! One cycle visits every input stream in registration order:
//!
//! ```text
//! Idle -> FetchingWatermark -> FetchingRaw -> Enriching -> Writing -> Sleeping -> ...
//!                  any unexpected failure -> FailedCycle -> Sleeping (recovery delay)
//! ```
//!
//! Store reads and writes failing for one stream skip that stream only. A
//! calculator that errors or panics loses its fields for that record and
//! nothing else. Anything else escaping a cycle, panics included, parks the
//! engine for the recovery delay before the next attempt. The loop ends only
//! when the shutdown channel says so.

use crate::calculators::{Calculator, EnrichContext};
use crate::config::{EngineSettings, MAX_LOOKBACK_DAYS};
use crate::error::{panic_message, EnricherError};
use crate::record::{EnrichedRecord, FieldMap, RawRecord};
use crate::registry::{CalculatorGroup, EnrichmentRegistry};
use crate::sink::BatchSink;
use crate::store::TimeSeriesStore;
use crate::watermark::WatermarkAccessor;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Transitions kept for slow subscribers before the oldest are dropped.
const TRANSITION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    FetchingWatermark,
    FetchingRaw,
    Enriching,
    Writing,
    Sleeping,
    FailedCycle,
}

#[derive(Debug, Clone)]
pub struct PollingOptions {
    pub poll_interval: Duration,
    /// Sleep after a failed cycle, longer than `poll_interval`.
    pub recovery_delay: Duration,
    /// How far back to read when an output stream has no records yet.
    pub initial_lookback: chrono::Duration,
    pub write_batch_size: usize,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            recovery_delay: Duration::from_secs(600),
            initial_lookback: chrono::Duration::days(30),
            write_batch_size: 5000,
        }
    }
}

impl From<&EngineSettings> for PollingOptions {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            recovery_delay: Duration::from_secs(settings.recovery_delay_secs),
            initial_lookback: chrono::Duration::days(
                settings.initial_lookback_days.clamp(0, MAX_LOOKBACK_DAYS),
            ),
            write_batch_size: settings.write_batch_size,
        }
    }
}

/// What one cycle did to one input stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub input: String,
    pub output: String,
    pub fetched: usize,
    pub enriched: usize,
    pub written: usize,
    pub dropped: usize,
    pub calculator_failures: usize,
    pub read_failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub streams: Vec<StreamReport>,
    /// Set when shutdown was requested before every stream was visited.
    pub cancelled: bool,
}

impl CycleReport {
    pub fn fetched(&self) -> usize {
        self.streams.iter().map(|s| s.fetched).sum()
    }

    pub fn written(&self) -> usize {
        self.streams.iter().map(|s| s.written).sum()
    }

    pub fn stream(&self, input: &str) -> Option<&StreamReport> {
        self.streams.iter().find(|s| s.input == input)
    }
}

pub struct PollingEngine {
    registry: EnrichmentRegistry,
    store: Arc<dyn TimeSeriesStore>,
    ctx: EnrichContext,
    watermarks: WatermarkAccessor,
    sink: BatchSink,
    options: PollingOptions,
    state: watch::Sender<EngineState>,
    transitions: broadcast::Sender<EngineState>,
}

impl PollingEngine {
    /// Fails when the registry has no calculators at all.
    pub fn new(
        registry: EnrichmentRegistry,
        store: Arc<dyn TimeSeriesStore>,
        options: PollingOptions,
    ) -> Result<Self, EnricherError> {
        if registry.is_empty() {
            error!("no calculators registered; refusing to start");
            return Err(EnricherError::NoCalculators);
        }
        for group in registry.groups() {
            info!(
                stream = group.input_stream(),
                output = group.output_stream(),
                calculators = group.len(),
                "enrichment stream configured"
            );
        }

        let (state, _) = watch::channel(EngineState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Ok(Self {
            ctx: EnrichContext::new(store.clone()),
            watermarks: WatermarkAccessor::new(store.clone()),
            sink: BatchSink::new(store.clone(), options.write_batch_size),
            registry,
            store,
            options,
            state,
            transitions,
        })
    }

    pub fn registry(&self) -> &EnrichmentRegistry {
        &self.registry
    }

    pub fn options(&self) -> &PollingOptions {
        &self.options
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Subscribe to the current state.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Subscribe to every state change in order. A watch receiver only sees
    /// the latest state, so short-lived states like `FailedCycle` show up
    /// here only.
    pub fn transitions(&self) -> broadcast::Receiver<EngineState> {
        self.transitions.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "engine state");
            // No subscribers is fine
            let _ = self.transitions.send(state);
        }
    }

    /// Runs cycles until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.options.poll_interval.as_secs(),
            recovery_delay_secs = self.options.recovery_delay.as_secs(),
            "polling engine started"
        );

        while !is_cancelled(&shutdown) {
            let delay = match AssertUnwindSafe(self.run_cycle(&shutdown))
                .catch_unwind()
                .await
            {
                Ok(Ok(report)) if report.cancelled => break,
                Ok(Ok(report)) => {
                    if report.fetched() > 0 {
                        info!(
                            fetched = report.fetched(),
                            written = report.written(),
                            "enrichment cycle complete"
                        );
                    } else {
                        debug!("enrichment cycle found no new records");
                    }
                    self.options.poll_interval
                }
                Ok(Err(e)) => {
                    self.set_state(EngineState::FailedCycle);
                    error!(error = %e, "enrichment cycle failed; backing off");
                    self.options.recovery_delay
                }
                Err(payload) => {
                    self.set_state(EngineState::FailedCycle);
                    error!(
                        error = %EnricherError::Panicked(panic_message(&*payload)),
                        "enrichment cycle failed; backing off"
                    );
                    self.options.recovery_delay
                }
            };

            self.set_state(EngineState::Sleeping);
            if !sleep_unless_cancelled(delay, &mut shutdown).await {
                break;
            }
        }

        self.set_state(EngineState::Idle);
        info!("polling engine stopped");
    }

    /// One pass over every input stream.
    pub async fn run_cycle(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, EnricherError> {
        let mut report = CycleReport::default();
        for group in self.registry.groups() {
            if is_cancelled(shutdown) {
                info!("shutdown requested; ending cycle early");
                report.cancelled = true;
                break;
            }
            report.streams.push(self.process_stream(group).await?);
        }
        Ok(report)
    }

    async fn process_stream(&self, group: &CalculatorGroup) -> Result<StreamReport, EnricherError> {
        let input = group.input_stream();
        let output = group.output_stream();
        let mut report = StreamReport {
            input: input.to_string(),
            output: output.to_string(),
            ..StreamReport::default()
        };

        self.set_state(EngineState::FetchingWatermark);
        let start = self
            .watermarks
            .resolve_start(output, Utc::now(), self.options.initial_lookback)
            .await?;

        self.set_state(EngineState::FetchingRaw);
        let records = match self.store.query_since(input, start).await {
            Ok(records) => records,
            Err(e) => {
                warn!(stream = input, error = %e, "raw fetch failed; skipping stream this cycle");
                report.read_failed = true;
                return Ok(report);
            }
        };
        report.fetched = records.len();
        if records.is_empty() {
            debug!(stream = input, after = %start, "no new records");
            return Ok(report);
        }
        debug!(stream = input, records = records.len(), after = %start, "fetched raw records");

        self.set_state(EngineState::Enriching);
        let mut batch = Vec::with_capacity(records.len());
        for record in &records {
            let (fields, failures) = self.enrich_record(group, record).await;
            report.calculator_failures += failures;
            if !fields.is_empty() {
                batch.push(EnrichedRecord::from_raw(output, record, fields));
            }
        }
        report.enriched = batch.len();
        if batch.is_empty() {
            debug!(stream = input, "no calculator produced fields");
            return Ok(report);
        }

        self.set_state(EngineState::Writing);
        let outcome = self.sink.write(output, batch).await;
        report.written = outcome.written;
        report.dropped = outcome.dropped;
        Ok(report)
    }

    /// Merged fields of every calculator in the group, later ones winning on
    /// name clashes, and the number of calculators that failed.
    async fn enrich_record(&self, group: &CalculatorGroup, record: &RawRecord) -> (FieldMap, usize) {
        let mut merged = FieldMap::new();
        let mut failures = 0;
        for calculator in group.calculators() {
            match self.invoke(calculator.as_ref(), record).await {
                Ok(Some(fields)) => merged.extend(fields),
                Ok(None) => {}
                Err(()) => failures += 1,
            }
        }
        (merged, failures)
    }

    async fn invoke(
        &self,
        calculator: &dyn Calculator,
        record: &RawRecord,
    ) -> Result<Option<FieldMap>, ()> {
        match AssertUnwindSafe(calculator.enrich(record, &self.ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(fields)) => Ok(fields),
            Ok(Err(e)) => {
                error!(
                    calculator = calculator.name(),
                    timestamp = %record.timestamp,
                    error = %e,
                    "calculator failed"
                );
                Err(())
            }
            Err(payload) => {
                error!(
                    calculator = calculator.name(),
                    timestamp = %record.timestamp,
                    panic = %panic_message(&*payload),
                    "calculator panicked"
                );
                Err(())
            }
        }
    }
}

fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleeps for `delay`. Returns false as soon as shutdown is requested or the
/// shutdown sender goes away.
async fn sleep_unless_cancelled(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
        if is_cancelled(shutdown) {
            return false;
        }
    }
}
