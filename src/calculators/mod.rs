//! Metric calculators.
//!
//! A calculator reads one input stream and contributes fields to one output
//! stream. The engine calls [`Calculator::enrich`] once per raw record;
//! calculators that need history (the sleep-consistency window, the latest
//! fitness age, the resting heart-rate trend) read it through the
//! [`EnrichContext`] rather than keeping state between calls.
//!
//! Returning `Ok(None)` means "nothing to add for this record". It is not an
//! error and contributes no fields to the merge.

pub mod consistency;
pub mod heart_rate;
pub mod sleep;
pub mod trend;

use crate::config::Settings;
use crate::error::{CalculatorError, StoreError};
use crate::record::{FieldMap, RawRecord};
use crate::store::TimeSeriesStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use std::sync::Arc;

pub use consistency::SleepConsistencyCalculator;
pub use heart_rate::{SleepHeartRateCalculator, Vo2HeartRateCalculator};
pub use sleep::{SleepEfficiencyCalculator, SleepJudgementCalculator};
pub use trend::RestingHeartRateTrendCalculator;

pub const SLEEP_SUMMARY: &str = "SleepSummary";
pub const ENRICHED_SLEEP_SUMMARY: &str = "EnrichedSleepSummary";
pub const VO2_MAX: &str = "VO2_Max";
pub const FITNESS_AGE: &str = "FitnessAge";
pub const ENRICHED_VO2_MAX: &str = "EnrichedVO2Max";
pub const DAILY_STATS: &str = "DailyStats";
pub const WELLNESS_TRENDS: &str = "wellness_trends";

/// Shared, read-only context handed to every calculator call.
#[derive(Clone)]
pub struct EnrichContext {
    store: Arc<dyn TimeSeriesStore>,
}

impl EnrichContext {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// Up to `limit` records of `stream` strictly before `before`, ascending.
    pub async fn preceding(
        &self,
        stream: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.query_before(stream, before, limit).await
    }

    /// The latest record of `stream` dated on or before the UTC day of `at`.
    /// Readings later on that same day count; the next day's do not.
    pub async fn latest_through_day(
        &self,
        stream: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RawRecord>, StoreError> {
        let bound = at
            .date_naive()
            .succ_opt()
            .map(|next| next.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(self.store.query_before(stream, bound, 1).await?.pop())
    }
}

#[async_trait]
pub trait Calculator: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Stream this calculator reads. `None` makes the registry reject it.
    fn input_stream(&self) -> Option<&str>;

    /// Stream this calculator's fields are written to.
    fn output_stream(&self) -> Option<&str>;

    async fn enrich(
        &self,
        record: &RawRecord,
        ctx: &EnrichContext,
    ) -> Result<Option<FieldMap>, CalculatorError>;
}

/// The calculators the service runs, in registration order. Reference tables
/// are loaded here, once; a table that fails to load leaves its calculator
/// inert rather than failing startup.
pub fn default_catalog(settings: &Settings) -> Vec<Box<dyn Calculator>> {
    let reference = &settings.reference;
    vec![
        Box::new(SleepEfficiencyCalculator),
        Box::new(SleepJudgementCalculator::from_path(&reference.sleep_scores_path())),
        Box::new(SleepConsistencyCalculator),
        Box::new(SleepHeartRateCalculator::from_path(&reference.sleep_hr_path())),
        Box::new(Vo2HeartRateCalculator::from_path(
            &reference.vo2_hr_path(),
            &settings.subject.sex,
        )),
        Box::new(RestingHeartRateTrendCalculator),
    ]
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
