//! Immutable reference tables loaded once at startup.
//!
//! Two shapes are supported:
//! - [`ScoreTable`]: ordered `min_score,max_score,judgement` ranges
//! - [`ReferenceGrid`]: `(inputs..., output)` samples partitioned by a
//!   categorical column, e.g. `Category,Median,HR` baseline curves or
//!   `sex,age,vo2,hr` grids
//!
//! Score tables are strict: a malformed row fails the load. Grids mirror how
//! the tables are produced in practice and silently drop rows whose numeric
//! cells are missing or unparseable.

use crate::error::ReferenceError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

fn open(path: &Path) -> Result<File, ReferenceError> {
    File::open(path).map_err(|source| ReferenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoreRange {
    pub min_score: f64,
    pub max_score: f64,
    pub judgement: String,
}

/// Ordered score ranges; the first inclusive match wins.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreTable {
    ranges: Vec<ScoreRange>,
}

impl ScoreTable {
    pub fn new(ranges: Vec<ScoreRange>) -> Self {
        Self { ranges }
    }

    pub fn from_path(path: &Path) -> Result<Self, ReferenceError> {
        Self::from_reader(open(path)?).map_err(|e| match e {
            ReferenceError::Empty(_) => ReferenceError::Empty(path.display().to_string()),
            other => other,
        })
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ReferenceError> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let ranges = csv
            .deserialize::<ScoreRange>()
            .collect::<Result<Vec<_>, _>>()?;
        if ranges.is_empty() {
            return Err(ReferenceError::Empty("score table".into()));
        }
        Ok(Self { ranges })
    }

    pub fn lookup(&self, score: f64) -> Option<&str> {
        self.ranges
            .iter()
            .find(|r| r.min_score <= score && score <= r.max_score)
            .map(|r| r.judgement.as_str())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// One reference sample.
#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub inputs: Vec<f64>,
    pub output: f64,
}

/// Reference samples partitioned by a categorical key. Keys compare
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ReferenceGrid {
    partitions: HashMap<String, Vec<GridRow>>,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

fn parse_cell(cell: Option<&str>) -> Option<f64> {
    cell.and_then(|c| c.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

impl ReferenceGrid {
    pub fn from_rows(rows: impl IntoIterator<Item = (String, GridRow)>) -> Self {
        let mut partitions: HashMap<String, Vec<GridRow>> = HashMap::new();
        for (key, row) in rows {
            partitions.entry(normalize_key(&key)).or_default().push(row);
        }
        Self { partitions }
    }

    pub fn from_path(
        path: &Path,
        key_column: &str,
        input_columns: &[&str],
        output_column: &str,
    ) -> Result<Self, ReferenceError> {
        Self::from_reader(open(path)?, key_column, input_columns, output_column).map_err(|e| {
            match e {
                ReferenceError::Empty(_) => ReferenceError::Empty(path.display().to_string()),
                other => other,
            }
        })
    }

    pub fn from_reader<R: Read>(
        reader: R,
        key_column: &str,
        input_columns: &[&str],
        output_column: &str,
    ) -> Result<Self, ReferenceError> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers = csv.headers()?.clone();
        let column = |name: &str| -> Result<usize, ReferenceError> {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or_else(|| ReferenceError::MissingColumn(name.to_string()))
        };

        let key_idx = column(key_column)?;
        let input_idx = input_columns
            .iter()
            .map(|c| column(*c))
            .collect::<Result<Vec<_>, _>>()?;
        let output_idx = column(output_column)?;

        let mut rows = Vec::new();
        for record in csv.records() {
            let record = record?;
            let Some(key) = record.get(key_idx) else {
                continue;
            };
            let inputs: Option<Vec<f64>> =
                input_idx.iter().map(|&i| parse_cell(record.get(i))).collect();
            let (Some(inputs), Some(output)) = (inputs, parse_cell(record.get(output_idx))) else {
                continue;
            };
            rows.push((key.to_string(), GridRow { inputs, output }));
        }

        if rows.is_empty() {
            return Err(ReferenceError::Empty("reference grid".into()));
        }
        Ok(Self::from_rows(rows))
    }

    /// Samples for one category, in file order.
    pub fn partition(&self, key: &str) -> &[GridRow] {
        self.partitions
            .get(&normalize_key(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `(x, y)` pairs of a one-input partition.
    pub fn curve(&self, key: &str) -> Vec<(f64, f64)> {
        self.partition(key)
            .iter()
            .filter_map(|r| r.inputs.first().map(|&x| (x, r.output)))
            .collect()
    }

    /// `([x, y], z)` samples of a two-input partition.
    pub fn surface(&self, key: &str) -> Vec<([f64; 2], f64)> {
        self.partition(key)
            .iter()
            .filter_map(|r| match r.inputs.as_slice() {
                [x, y, ..] => Some(([*x, *y], r.output)),
                _ => None,
            })
            .collect()
    }
}
