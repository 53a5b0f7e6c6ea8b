//! Rolling sleep-consistency index.
//!
//! Each night is reduced to a minute-of-day occupancy mask (asleep between
//! sleep onset and wake, wrapping across midnight). The index for a night is
//! the percentage of the 1440 minutes on which every night in the window
//! agrees: all asleep or all awake. The window is the current night plus up
//! to three preceding rows of the sleep stream, taken positionally, so gaps
//! in the data widen the calendar span rather than shrinking the window.

use super::sleep::SLEEP_TIME_SECONDS;
use super::{Calculator, EnrichContext, ENRICHED_SLEEP_SUMMARY, SLEEP_SUMMARY};
use crate::error::CalculatorError;
use crate::record::{FieldMap, FieldValue, RawRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};

pub const MINUTES_PER_DAY: usize = 24 * 60;
/// Current night plus three preceding rows.
pub const WINDOW_ROWS: usize = 4;
pub const MIN_VALID_NIGHTS: usize = 2;

/// One night reconstructed from a sleep summary row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SleepInterval {
    /// Calendar night the sleep belongs to: the wake date minus one day.
    pub sleep_date: NaiveDate,
    pub sleep_time: DateTime<Utc>,
    pub wake_time: DateTime<Utc>,
    pub duration_hours: f64,
}

impl SleepInterval {
    /// The row timestamp is the wake time; onset is wake minus time asleep.
    pub fn from_record(record: &RawRecord) -> Option<Self> {
        let seconds = record.number(SLEEP_TIME_SECONDS).filter(|s| *s >= 0.0)?;
        let wake_time = record.timestamp;
        let asleep = Duration::milliseconds((seconds * 1000.0).round() as i64);
        let sleep_time = wake_time.checked_sub_signed(asleep)?;
        let sleep_date = wake_time.date_naive().pred_opt()?;
        Some(Self {
            sleep_date,
            sleep_time,
            wake_time,
            duration_hours: seconds / 3600.0,
        })
    }

    /// Minute-of-day occupancy, `true` while asleep.
    pub fn occupancy(&self) -> Vec<bool> {
        let mut mask = vec![false; MINUTES_PER_DAY];
        let bed = minute_of_day(self.sleep_time);
        let wake = minute_of_day(self.wake_time);
        if wake < bed {
            mask[bed..].fill(true);
            mask[..wake].fill(true);
        } else {
            mask[bed..wake].fill(true);
        }
        mask
    }
}

fn minute_of_day(ts: DateTime<Utc>) -> usize {
    (ts.hour() * 60 + ts.minute()) as usize
}

/// Percentage of minutes on which all nights agree. `None` with fewer than
/// two nights.
pub fn consistency_index(nights: &[SleepInterval]) -> Option<f64> {
    if nights.len() < MIN_VALID_NIGHTS {
        return None;
    }
    let masks: Vec<Vec<bool>> = nights.iter().map(SleepInterval::occupancy).collect();
    let agreeing = (0..MINUTES_PER_DAY)
        .filter(|&minute| {
            let first = masks[0][minute];
            masks.iter().all(|m| m[minute] == first)
        })
        .count();
    Some(agreeing as f64 / MINUTES_PER_DAY as f64 * 100.0)
}

/// Consistency index for `record` over its positional window in `stream`.
/// Rows without a usable sleep duration are dropped from the window first.
pub async fn window_consistency(
    record: &RawRecord,
    stream: &str,
    ctx: &EnrichContext,
) -> Result<Option<f64>, CalculatorError> {
    let mut window = ctx
        .preceding(stream, record.timestamp, WINDOW_ROWS - 1)
        .await?;
    window.push(record.clone());
    let nights: Vec<SleepInterval> = window.iter().filter_map(SleepInterval::from_record).collect();
    Ok(consistency_index(&nights))
}

/// Emits `SleepConsistencyIndex`, `SleepDuration` (hours) and `SleepDate`,
/// the calendar night as `YYYY-MM-DD`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepConsistencyCalculator;

#[async_trait]
impl Calculator for SleepConsistencyCalculator {
    fn name(&self) -> &str {
        "Sleep Consistency Index"
    }

    fn input_stream(&self) -> Option<&str> {
        Some(SLEEP_SUMMARY)
    }

    fn output_stream(&self) -> Option<&str> {
        Some(ENRICHED_SLEEP_SUMMARY)
    }

    async fn enrich(
        &self,
        record: &RawRecord,
        ctx: &EnrichContext,
    ) -> Result<Option<FieldMap>, CalculatorError> {
        let mut fields = FieldMap::new();
        if let Some(night) = SleepInterval::from_record(record) {
            fields.insert("SleepDuration".into(), FieldValue::Float(night.duration_hours));
            fields.insert(
                "SleepDate".into(),
                FieldValue::Text(night.sleep_date.format("%Y-%m-%d").to_string()),
            );
        }
        if let Some(sci) = window_consistency(record, SLEEP_SUMMARY, ctx).await? {
            fields.insert("SleepConsistencyIndex".into(), FieldValue::Float(sci));
        }
        Ok((!fields.is_empty()).then_some(fields))
    }
}
