//! Per-record sleep summary enrichments.

use super::{round2, Calculator, EnrichContext, ENRICHED_SLEEP_SUMMARY, SLEEP_SUMMARY};
use crate::error::CalculatorError;
use crate::record::{FieldMap, FieldValue, RawRecord};
use crate::reference::ScoreTable;
use async_trait::async_trait;
use std::path::Path;
use tracing::{error, info};

pub const SLEEP_TIME_SECONDS: &str = "sleepTimeSeconds";
pub const AWAKE_SLEEP_SECONDS: &str = "awakeSleepSeconds";
pub const SLEEP_SCORE: &str = "sleepScore";

/// Share of time in bed actually spent asleep, in percent.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepEfficiencyCalculator;

impl SleepEfficiencyCalculator {
    pub fn efficiency(sleep_seconds: f64, awake_seconds: f64) -> Option<f64> {
        let in_bed = sleep_seconds + awake_seconds;
        (in_bed > 0.0).then(|| round2(100.0 * sleep_seconds / in_bed))
    }
}

#[async_trait]
impl Calculator for SleepEfficiencyCalculator {
    fn name(&self) -> &str {
        "Sleep Efficiency Calculator"
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
        _ctx: &EnrichContext,
    ) -> Result<Option<FieldMap>, CalculatorError> {
        let (Some(sleep), Some(awake)) = (
            record.number(SLEEP_TIME_SECONDS),
            record.number(AWAKE_SLEEP_SECONDS),
        ) else {
            return Ok(None);
        };
        Ok(Self::efficiency(sleep, awake).map(|pct| {
            FieldMap::from([("sleepEfficiencyPercent".to_string(), FieldValue::Float(pct))])
        }))
    }
}

/// Qualitative label for the nightly sleep score.
///
/// The score table is read once at construction. If it cannot be loaded the
/// calculator stays inert for the life of the process.
#[derive(Debug, Clone)]
pub struct SleepJudgementCalculator {
    table: Option<ScoreTable>,
}

impl SleepJudgementCalculator {
    pub fn new(table: Option<ScoreTable>) -> Self {
        Self { table }
    }

    pub fn from_path(path: &Path) -> Self {
        match ScoreTable::from_path(path) {
            Ok(table) => {
                info!(path = %path.display(), ranges = table.len(), "loaded sleep score table");
                Self::new(Some(table))
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "sleep score table unavailable; sleep judgement disabled"
                );
                Self::new(None)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.table.is_some()
    }
}

#[async_trait]
impl Calculator for SleepJudgementCalculator {
    fn name(&self) -> &str {
        "Sleep Score Judgement"
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
        _ctx: &EnrichContext,
    ) -> Result<Option<FieldMap>, CalculatorError> {
        let (Some(table), Some(score)) = (&self.table, record.number(SLEEP_SCORE)) else {
            return Ok(None);
        };
        Ok(table.lookup(score).map(|label| {
            FieldMap::from([("sleepJudgement".to_string(), FieldValue::from(label))])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ScoreRange;
    use crate::store::InMemoryStore;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn ctx() -> EnrichContext {
        EnrichContext::new(Arc::new(InMemoryStore::new()))
    }

    fn night() -> RawRecord {
        RawRecord::new(Utc.with_ymd_and_hms(2024, 5, 2, 6, 45, 0).unwrap())
    }

    #[test]
    fn test_efficiency_formula() {
        assert_eq!(SleepEfficiencyCalculator::efficiency(21600.0, 3600.0), Some(85.71));
        assert_eq!(SleepEfficiencyCalculator::efficiency(100.0, 0.0), Some(100.0));
        assert_eq!(SleepEfficiencyCalculator::efficiency(0.0, 0.0), None);
    }

    #[tokio::test]
    async fn test_efficiency_requires_both_fields() {
        let calc = SleepEfficiencyCalculator;
        let record = night()
            .with_field(SLEEP_TIME_SECONDS, 21600i64)
            .with_field(AWAKE_SLEEP_SECONDS, 3600i64);
        let fields = calc.enrich(&record, &ctx()).await.unwrap().unwrap();
        assert_eq!(fields["sleepEfficiencyPercent"], FieldValue::Float(85.71));

        let partial = night().with_field(SLEEP_TIME_SECONDS, 21600i64);
        assert!(calc.enrich(&partial, &ctx()).await.unwrap().is_none());

        let empty_night = night()
            .with_field(SLEEP_TIME_SECONDS, 0i64)
            .with_field(AWAKE_SLEEP_SECONDS, 0i64);
        assert!(calc.enrich(&empty_night, &ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_judgement_lookup() {
        let calc = SleepJudgementCalculator::new(Some(ScoreTable::new(vec![
            ScoreRange {
                min_score: 0.0,
                max_score: 50.0,
                judgement: "poor".into(),
            },
            ScoreRange {
                min_score: 51.0,
                max_score: 100.0,
                judgement: "good".into(),
            },
        ])));

        let record = night().with_field(SLEEP_SCORE, 75i64);
        let fields = calc.enrich(&record, &ctx()).await.unwrap().unwrap();
        assert_eq!(fields["sleepJudgement"], FieldValue::Text("good".into()));

        let between = night().with_field(SLEEP_SCORE, 50.5);
        assert!(calc.enrich(&between, &ctx()).await.unwrap().is_none());
        assert!(calc.enrich(&night(), &ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_judgement_inert_without_table() {
        let calc = SleepJudgementCalculator::from_path(Path::new("/nonexistent/scores.csv"));
        assert!(!calc.is_active());
        let record = night().with_field(SLEEP_SCORE, 75i64);
        assert!(calc.enrich(&record, &ctx()).await.unwrap().is_none());
    }
}
