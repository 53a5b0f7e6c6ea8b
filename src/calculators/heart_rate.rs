//! Heart-rate baselines derived from reference curves and grids.

use super::consistency::{window_consistency, SleepInterval};
use super::{
    Calculator, EnrichContext, ENRICHED_SLEEP_SUMMARY, ENRICHED_VO2_MAX, FITNESS_AGE,
    SLEEP_SUMMARY, VO2_MAX,
};
use crate::error::CalculatorError;
use crate::interpolation::{linear_1d, GridInterpolator};
use crate::record::{FieldMap, FieldValue, RawRecord};
use crate::reference::ReferenceGrid;
use async_trait::async_trait;
use std::path::Path;
use tracing::{error, info, warn};

pub const CONSISTENCY_CATEGORY: &str = "sci";
pub const DURATION_CATEGORY: &str = "dur";
pub const VO2_MAX_VALUE: &str = "VO2_max_value";
pub const CHRONOLOGICAL_AGE: &str = "chronologicalAge";

/// Blends two sleep baselines into an expected sleeping heart-rate factor.
///
/// `sleep_hr.csv` holds `Category,Median,HR` rows: category `sci` maps the
/// consistency index and `dur` maps sleep duration in hours to a heart-rate
/// multiplier. `SleepHR` is the product of both, a missing factor counting
/// as 1.
#[derive(Debug, Clone, Default)]
pub struct SleepHeartRateCalculator {
    consistency_curve: Vec<(f64, f64)>,
    duration_curve: Vec<(f64, f64)>,
}

impl SleepHeartRateCalculator {
    pub fn new(grid: &ReferenceGrid) -> Self {
        Self {
            consistency_curve: grid.curve(CONSISTENCY_CATEGORY),
            duration_curve: grid.curve(DURATION_CATEGORY),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        match ReferenceGrid::from_path(path, "Category", &["Median"], "HR") {
            Ok(grid) => {
                let calc = Self::new(&grid);
                info!(
                    path = %path.display(),
                    sci_points = calc.consistency_curve.len(),
                    dur_points = calc.duration_curve.len(),
                    "loaded sleep heart-rate baselines"
                );
                calc
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "sleep heart-rate baselines unavailable; SleepHR disabled"
                );
                Self::default()
            }
        }
    }

    pub fn is_active(&self) -> bool {
        !self.consistency_curve.is_empty() || !self.duration_curve.is_empty()
    }

    /// `(consistency factor, duration factor, combined)`; the combined value
    /// is `None` only when neither factor is available.
    pub fn blend(
        &self,
        consistency: Option<f64>,
        duration_hours: Option<f64>,
    ) -> (Option<f64>, Option<f64>, Option<f64>) {
        let sci_hr = consistency.and_then(|x| linear_1d(&self.consistency_curve, x));
        let dur_hr = duration_hours.and_then(|x| linear_1d(&self.duration_curve, x));
        let combined = match (sci_hr, dur_hr) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(1.0) * b.unwrap_or(1.0)),
        };
        (sci_hr, dur_hr, combined)
    }
}

#[async_trait]
impl Calculator for SleepHeartRateCalculator {
    fn name(&self) -> &str {
        "Sleep Heart-Rate Baseline"
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
        if !self.is_active() {
            return Ok(None);
        }
        let duration = SleepInterval::from_record(record).map(|n| n.duration_hours);
        let consistency = if self.consistency_curve.is_empty() {
            None
        } else {
            window_consistency(record, SLEEP_SUMMARY, ctx).await?
        };

        let (sci_hr, dur_hr, combined) = self.blend(consistency, duration);
        let mut fields = FieldMap::new();
        if let Some(v) = sci_hr {
            fields.insert("SleepConsistencyIndexHR".into(), FieldValue::Float(v));
        }
        if let Some(v) = dur_hr {
            fields.insert("DurationHR".into(), FieldValue::Float(v));
        }
        if let Some(v) = combined {
            fields.insert("SleepHR".into(), FieldValue::Float(v));
        }
        Ok((!fields.is_empty()).then_some(fields))
    }
}

/// Expected heart rate for a VO2 max reading at the subject's age.
///
/// `vo2_hr.csv` holds `sex,age,vo2,hr` rows; only the configured sex is kept.
/// Estimates come from linear interpolation over the grid, falling back to
/// the nearest grid point outside its convex hull.
#[derive(Debug, Clone, Default)]
pub struct Vo2HeartRateCalculator {
    interpolator: Option<GridInterpolator>,
}

impl Vo2HeartRateCalculator {
    pub fn new(grid: &ReferenceGrid, sex: &str) -> Self {
        let samples = grid.surface(sex);
        if samples.is_empty() {
            warn!(sex, "VO2 heart-rate grid has no rows for this sex; VO2 baseline disabled");
            return Self::default();
        }
        Self {
            interpolator: Some(GridInterpolator::new(&samples)),
        }
    }

    pub fn from_path(path: &Path, sex: &str) -> Self {
        match ReferenceGrid::from_path(path, "sex", &["age", "vo2"], "hr") {
            Ok(grid) => {
                info!(path = %path.display(), sex, "loaded VO2 heart-rate grid");
                Self::new(&grid, sex)
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "VO2 heart-rate grid unavailable; VO2 baseline disabled"
                );
                Self::default()
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.interpolator.is_some()
    }

    /// Age from the record itself, else from the last fitness-age reading of
    /// the record's day, carried forward from earlier days when that day has none.
    async fn age_for(
        &self,
        record: &RawRecord,
        ctx: &EnrichContext,
    ) -> Result<Option<f64>, CalculatorError> {
        if let Some(age) = record.number(CHRONOLOGICAL_AGE) {
            return Ok(Some(age));
        }
        Ok(ctx
            .latest_through_day(FITNESS_AGE, record.timestamp)
            .await?
            .and_then(|r| r.number(CHRONOLOGICAL_AGE)))
    }
}

#[async_trait]
impl Calculator for Vo2HeartRateCalculator {
    fn name(&self) -> &str {
        "VO2 Heart-Rate Baseline"
    }

    fn input_stream(&self) -> Option<&str> {
        Some(VO2_MAX)
    }

    fn output_stream(&self) -> Option<&str> {
        Some(ENRICHED_VO2_MAX)
    }

    async fn enrich(
        &self,
        record: &RawRecord,
        ctx: &EnrichContext,
    ) -> Result<Option<FieldMap>, CalculatorError> {
        let Some(interpolator) = &self.interpolator else {
            return Ok(None);
        };
        let Some(vo2) = record.number(VO2_MAX_VALUE) else {
            return Ok(None);
        };
        let Some(age) = self.age_for(record, ctx).await? else {
            return Ok(None);
        };
        Ok(interpolator.estimate([age, vo2]).map(|hr| {
            FieldMap::from([("Vo2BaselineHR".to_string(), FieldValue::Float(hr))])
        }))
    }
}
