//! Parameter specifications, random sampling of parameter sets, and normalization.
//!
//! A [`ParameterSpec`] lists the tunable parameters of a model in column order. A
//! [`SampleBatch`] is a table of parameter sets with one row per sample and one column
//! per parameter, either drawn at random with [`SampleBatch::rand`] or loaded from a
//! plain text table with [`SampleBatch::load_from`].
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use itertools::Itertools;
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::SweepError;
use crate::partition::WorkerRange;

/// A single parameter set, i.e., one value per entry of a [`ParameterSpec`].
pub type ParameterSet = Vec<f64>;

/// The physical bounds of a named parameter.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ParameterRange {
    /// The parameter name, e.g., `gnabar_soma`.
    pub name: String,
    /// The lower bound (inclusive).
    pub min: f64,
    /// The upper bound (exclusive for sampling).
    pub max: f64,
}

impl ParameterRange {
    pub fn new(name: &str, min: f64, max: f64) -> Self {
        ParameterRange {
            name: name.to_string(),
            min,
            max,
        }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.min + self.max)
    }

    /// Rescale a value of the unit interval into the physical bounds.
    pub fn rescale(&self, unit: f64) -> f64 {
        unit * (self.max - self.min) + self.min
    }

    /// Map a physical value into `[-minmax, minmax]`.
    pub fn normalize(&self, value: f64, minmax: f64) -> f64 {
        2.0 * minmax * ((value - self.min) / self.width()) - minmax
    }

    /// Map a value of `[-minmax, minmax]` back into physical units.
    pub fn denormalize(&self, value: f64, minmax: f64) -> f64 {
        (value + minmax) * self.width() / (2.0 * minmax) + self.min
    }
}

/// An ordered collection of parameter ranges. The order matches the columns of every
/// persisted table.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    ranges: Vec<ParameterRange>,
}

impl ParameterSpec {
    /// Create a parameter specification from (name, min, max) triples.
    /// Returns an error if a bound is not finite or if a range is inverted.
    pub fn build<'a, I>(triples: I) -> Result<Self, SweepError>
    where
        I: IntoIterator<Item = (&'a str, f64, f64)>,
    {
        let ranges = triples
            .into_iter()
            .map(|(name, min, max)| ParameterRange::new(name, min, max))
            .collect::<Vec<_>>();

        for range in ranges.iter() {
            if !range.min.is_finite() || !range.max.is_finite() {
                return Err(SweepError::InvalidParameter(format!(
                    "bounds of {} must be finite, got ({}, {})",
                    range.name, range.min, range.max
                )));
            }
            if range.min > range.max {
                return Err(SweepError::InvalidParameter(format!(
                    "range of {} is inverted: min {} > max {}",
                    range.name, range.min, range.max
                )));
            }
        }

        Ok(ParameterSpec { ranges })
    }

    /// Returns the number of parameters.
    pub fn dim(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[ParameterRange] {
        &self.ranges
    }

    pub fn names(&self) -> Vec<String> {
        self.ranges.iter().map(|range| range.name.clone()).collect()
    }

    /// Returns the D×2 table of (min, max) bounds.
    pub fn bounds(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.dim(), 2, |j, k| match k {
            0 => self.ranges[j].min,
            _ => self.ranges[j].max,
        })
    }

    /// Returns an error if the parameter set does not have one value per parameter.
    pub fn check_len(&self, params: &[f64]) -> Result<(), SweepError> {
        if params.len() != self.dim() {
            return Err(SweepError::InvalidParameter(format!(
                "expected {} parameters ({}), got {}",
                self.dim(),
                self.names().join(", "),
                params.len()
            )));
        }
        Ok(())
    }
}

/// A table of parameter sets, one row per sample and one column per parameter.
#[derive(Debug, PartialEq, Clone)]
pub struct SampleBatch {
    values: DMatrix<f64>,
}

impl SampleBatch {
    pub fn from_matrix(values: DMatrix<f64>) -> Self {
        SampleBatch { values }
    }

    /// Create a batch from a list of parameter sets with `dim` values each.
    pub fn from_rows(rows: &[ParameterSet], dim: usize) -> Result<Self, SweepError> {
        if let Some(row) = rows.iter().find(|row| row.len() != dim) {
            return Err(SweepError::InvalidParameter(format!(
                "expected {} values per parameter set, got {}",
                dim,
                row.len()
            )));
        }
        let data = rows.iter().flatten().copied().collect::<Vec<f64>>();
        Ok(SampleBatch {
            values: DMatrix::from_row_slice(rows.len(), dim, &data),
        })
    }

    /// Draw `num_samples` parameter sets uniformly at random within the bounds of the specification.
    ///
    /// Every value is obtained by drawing in [0, 1) and rescaling into [min, max) of its column.
    /// Draws are consumed row after row, so a seeded generator always produces the same table.
    pub fn rand<R: Rng>(spec: &ParameterSpec, num_samples: usize, rng: &mut R) -> Self {
        let unit = Uniform::new(0.0_f64, 1.0_f64);
        let data = (0..num_samples)
            .flat_map(|_| spec.ranges().iter())
            .map(|range| range.rescale(unit.sample(rng)))
            .collect::<Vec<f64>>();

        SampleBatch {
            values: DMatrix::from_row_slice(num_samples, spec.dim(), &data),
        }
    }

    /// Returns the number of samples (rows).
    pub fn num_samples(&self) -> usize {
        self.values.nrows()
    }

    /// Returns the number of parameters (columns).
    pub fn dim(&self) -> usize {
        self.values.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Returns the parameter set of the given row.
    pub fn row(&self, i: usize) -> ParameterSet {
        self.values.row(i).iter().copied().collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = ParameterSet> + '_ {
        (0..self.num_samples()).map(move |i| self.row(i))
    }

    /// Returns the sub-batch covering a worker range.
    pub fn slice(&self, range: &WorkerRange) -> Result<Self, SweepError> {
        if range.stop > self.num_samples() {
            return Err(SweepError::ShapeMismatch(format!(
                "range [{}, {}) exceeds the {} available parameter sets",
                range.start,
                range.stop,
                self.num_samples()
            )));
        }
        Ok(SampleBatch {
            values: self.values.rows_range(range.start..range.stop).clone_owned(),
        })
    }

    /// Map every column from its physical range into `[-minmax, minmax]`.
    pub fn normalize(&self, spec: &ParameterSpec, minmax: f64) -> Result<SampleBatch, SweepError> {
        self.map_columns(spec, minmax, |range, x| range.normalize(x, minmax))
    }

    /// Inverse of [`SampleBatch::normalize`].
    pub fn denormalize(&self, spec: &ParameterSpec, minmax: f64) -> Result<SampleBatch, SweepError> {
        self.map_columns(spec, minmax, |range, y| range.denormalize(y, minmax))
    }

    fn map_columns<F>(&self, spec: &ParameterSpec, minmax: f64, f: F) -> Result<SampleBatch, SweepError>
    where
        F: Fn(&ParameterRange, f64) -> f64,
    {
        if self.dim() != spec.dim() {
            return Err(SweepError::ShapeMismatch(format!(
                "batch has {} columns but the parameter specification has {}",
                self.dim(),
                spec.dim()
            )));
        }
        if !(minmax > 0.0) {
            return Err(SweepError::InvalidParameter(format!(
                "normalization bound must be positive, got {}",
                minmax
            )));
        }
        if let Some(range) = spec.ranges().iter().find(|range| range.width() == 0.0) {
            return Err(SweepError::InvalidParameter(format!(
                "cannot normalize {}: its range has zero width",
                range.name
            )));
        }

        let mut values = self.values.clone();
        for (j, range) in spec.ranges().iter().enumerate() {
            values.column_mut(j).apply(|x| *x = f(range, *x));
        }
        Ok(SampleBatch { values })
    }

    /// Load a batch from a plain numeric text table, one parameter set per line.
    /// Values are separated by whitespace or commas; blank lines and `#` comments are skipped.
    pub fn load_from<P: AsRef<Path>>(path: P, spec: &ParameterSpec) -> Result<Self, SweepError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            SweepError::IOError(format!("cannot open parameter file {}: {}", path.display(), e))
        })?;

        let mut rows: Vec<ParameterSet> = vec![];
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|token| !token.is_empty())
                .map(|token| token.parse::<f64>())
                .collect::<Result<ParameterSet, _>>()
                .map_err(|e| {
                    SweepError::InvalidParameter(format!(
                        "{}:{}: {}",
                        path.display(),
                        lineno + 1,
                        e
                    ))
                })?;
            spec.check_len(&row).map_err(|e| {
                SweepError::InvalidParameter(format!("{}:{}: {}", path.display(), lineno + 1, e))
            })?;
            rows.push(row);
        }

        log::debug!("Loaded {} parameter sets from {}", rows.len(), path.display());
        SampleBatch::from_rows(&rows, spec.dim())
    }

    /// Save the batch as a plain numeric text table.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), SweepError> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        for row in self.rows() {
            writeln!(writer, "{}", row.iter().map(|v| format!("{:.17e}", v)).join(" "))?;
        }
        writer.flush()?;
        Ok(())
    }
}
