//! Seven-day resting heart-rate trend.
//!
//! Readings are first averaged per UTC day, then the day means of the
//! record's own day and the six days before it are averaged. Days without a
//! reading drop out of the mean, so a single reading is its own trend.

use super::{round2, Calculator, EnrichContext, DAILY_STATS, WELLNESS_TRENDS};
use crate::error::CalculatorError;
use crate::record::{FieldMap, FieldValue, RawRecord};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use std::collections::BTreeMap;

pub const RESTING_HEART_RATE: &str = "restingHeartRate";
pub const RHR_7DAY_AVG: &str = "rhr_7day_avg";
/// Calendar days in the window, the record's day included.
pub const TREND_DAYS: i64 = 7;
/// Preceding rows read per record; leaves room for several readings a day.
const HISTORY_ROWS: usize = 64;

/// Mean of the per-day means of `readings`. `None` when empty.
pub fn daily_mean_average(readings: &[(NaiveDate, f64)]) -> Option<f64> {
    let mut days: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for (day, value) in readings {
        let entry = days.entry(*day).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
    if days.is_empty() {
        return None;
    }
    let total: f64 = days.values().map(|(sum, n)| sum / *n as f64).sum();
    Some(total / days.len() as f64)
}

fn usable(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Emits `rhr_7day_avg` for every DailyStats row carrying a resting heart rate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestingHeartRateTrendCalculator;

#[async_trait]
impl Calculator for RestingHeartRateTrendCalculator {
    fn name(&self) -> &str {
        "Resting Heart-Rate Trend"
    }

    fn input_stream(&self) -> Option<&str> {
        Some(DAILY_STATS)
    }

    fn output_stream(&self) -> Option<&str> {
        Some(WELLNESS_TRENDS)
    }

    async fn enrich(
        &self,
        record: &RawRecord,
        ctx: &EnrichContext,
    ) -> Result<Option<FieldMap>, CalculatorError> {
        let Some(current) = record.number(RESTING_HEART_RATE) else {
            return Ok(None);
        };
        if !usable(current) {
            return Err(CalculatorError::InvalidField {
                field: RESTING_HEART_RATE.to_string(),
                reason: format!("expected a positive heart rate, got {current}"),
            });
        }

        let today = record.timestamp.date_naive();
        let first_day = today
            .checked_sub_signed(Duration::days(TREND_DAYS - 1))
            .unwrap_or(NaiveDate::MIN);
        let mut readings: Vec<(NaiveDate, f64)> = ctx
            .preceding(DAILY_STATS, record.timestamp, HISTORY_ROWS)
            .await?
            .iter()
            .filter_map(|row| {
                let day = row.timestamp.date_naive();
                let value = row.number(RESTING_HEART_RATE).filter(|v| usable(*v))?;
                (day >= first_day).then_some((day, value))
            })
            .collect();
        readings.push((today, current));

        Ok(daily_mean_average(&readings).map(|avg| {
            let mut fields = FieldMap::new();
            fields.insert(RHR_7DAY_AVG.into(), FieldValue::Float(round2(avg)));
            fields
        }))
    }
}
