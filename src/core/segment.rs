//! Fixed-interval resampling
//!
//! Projects every point onto a monotonic axis (cumulative distance or elapsed
//! time), lays a uniform grid over it and computes each column at each grid
//! position according to the column's [`InterpolationPolicy`]. Purely
//! computational: no I/O, safe to call inline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::context::RunContext;
use crate::core::model::{ColumnType, Diagnostic, Route, Stage, Value};
use crate::core::table::{Column, Table};
use crate::{Error, Result};

/// Relative slack when deciding whether the total length is already on the grid
const GRID_EPSILON: f64 = 1e-9;

/// Name of the axis column prepended to segmented tables
pub const POSITION_COLUMN: &str = "position";

/// Default ceiling on output samples per route
pub const DEFAULT_MAX_SAMPLES: usize = 10_000_000;

/// How a column is computed at a grid position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationPolicy {
    /// Proportional between the bracketing points
    Linear,
    /// Last known value at or before the sample
    ///
    /// Points tied on the axis resolve to the first of the tie.
    #[serde(alias = "nearest")]
    Hold,
    /// Only on samples that coincide with an original point carrying a value
    Impulse,
    /// At most one emission per inter-sample interval, at the interval's end
    Once,
}

impl fmt::Display for InterpolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterpolationPolicy::Linear => "linear",
            InterpolationPolicy::Hold => "hold",
            InterpolationPolicy::Impulse => "impulse",
            InterpolationPolicy::Once => "once",
        };
        f.write_str(name)
    }
}

impl FromStr for InterpolationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(InterpolationPolicy::Linear),
            "hold" | "nearest" => Ok(InterpolationPolicy::Hold),
            "impulse" => Ok(InterpolationPolicy::Impulse),
            "once" => Ok(InterpolationPolicy::Once),
            other => Err(Error::Configuration(format!(
                "Unknown interpolation policy '{other}'. Expected one of: linear, hold, impulse, once"
            ))),
        }
    }
}

impl InterpolationPolicy {
    /// Policy used when the configuration names none for a column
    pub fn default_for(column: &Column) -> Self {
        if column.event {
            InterpolationPolicy::Impulse
        } else if column.is_interpolable() {
            InterpolationPolicy::Linear
        } else {
            InterpolationPolicy::Hold
        }
    }
}

/// Spacing of the output grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingInterval {
    /// Metres of travelled distance
    Distance(f64),
    /// Seconds of elapsed time
    Duration(f64),
}

impl SamplingInterval {
    fn step(self) -> f64 {
        match self {
            SamplingInterval::Distance(v) | SamplingInterval::Duration(v) => v,
        }
    }
}

/// Validated segmentation settings
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationConfig {
    pub interval: SamplingInterval,
    /// Explicit per-column policies; everything else uses type defaults
    pub policies: BTreeMap<String, InterpolationPolicy>,
    pub impulse_tolerance: f64,
    /// Routes that would produce more samples than this are rejected
    pub max_samples: usize,
}

impl SegmentationConfig {
    pub fn new(interval: SamplingInterval) -> Result<Self> {
        let step = interval.step();
        if !step.is_finite() || step <= 0.0 {
            return Err(Error::Configuration(format!(
                "sampling interval must be a positive number, got {step}"
            )));
        }
        Ok(Self {
            interval,
            policies: BTreeMap::new(),
            impulse_tolerance: 1e-6,
            max_samples: DEFAULT_MAX_SAMPLES,
        })
    }

    pub fn with_policy(mut self, column: impl Into<String>, policy: InterpolationPolicy) -> Self {
        self.policies.insert(column.into(), policy);
        self
    }

    pub fn with_policies(mut self, policies: BTreeMap<String, InterpolationPolicy>) -> Self {
        self.policies.extend(policies);
        self
    }

    pub fn with_impulse_tolerance(mut self, tolerance: f64) -> Self {
        self.impulse_tolerance = tolerance.abs();
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    /// Fail on policies naming columns outside `known`
    pub fn check_columns(&self, known: &[String]) -> Result<()> {
        for column in self.policies.keys() {
            if column == POSITION_COLUMN || !known.contains(column) {
                return Err(Error::unknown_column("segmentation options", column, known));
            }
        }
        Ok(())
    }

    /// Resolve exactly one policy per schema column
    pub fn resolve(&self, schema: &[Column]) -> Result<Vec<InterpolationPolicy>> {
        let known: Vec<String> = schema.iter().map(|c| c.name.clone()).collect();
        self.check_columns(&known)?;

        schema
            .iter()
            .map(|column| {
                let policy = self
                    .policies
                    .get(&column.name)
                    .copied()
                    .unwrap_or_else(|| InterpolationPolicy::default_for(column));
                if policy == InterpolationPolicy::Linear && !column.is_interpolable() {
                    let what = if column.categorical {
                        "identifiers".to_string()
                    } else {
                        format!("{} values", column.kind)
                    };
                    return Err(Error::Configuration(format!(
                        "column '{}' holds {what} and cannot be interpolated linearly",
                        column.name
                    )));
                }
                Ok(policy)
            })
            .collect()
    }
}

/// One row of the resampled output
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Position on the axis: metres or seconds from the route start
    pub position: f64,
    /// Values in schema order
    pub values: Vec<Value>,
}

/// Resampled route
#[derive(Debug, Clone, PartialEq)]
pub struct Segmented {
    pub interval: SamplingInterval,
    pub schema: Vec<Column>,
    pub policies: Vec<InterpolationPolicy>,
    pub samples: Vec<Sample>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Segmented {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Values of one column across all samples
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let index = self.schema.iter().position(|c| c.name == name)?;
        Some(self.samples.iter().map(|s| &s.values[index]).collect())
    }

    pub fn positions(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.position).collect()
    }

    /// Table with the axis position as its first column
    pub fn to_table(&self) -> Result<Table> {
        let mut schema = Vec::with_capacity(self.schema.len() + 1);
        schema.push(Column::new(POSITION_COLUMN, ColumnType::Number));
        schema.extend(self.schema.iter().cloned());

        let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(self.samples.len()); schema.len()];
        for sample in &self.samples {
            columns[0].push(Value::Number(sample.position));
            for (i, value) in sample.values.iter().enumerate() {
                columns[i + 1].push(value.clone());
            }
        }
        Table::new(schema, columns)
    }
}

/// Monotonic parameter of every point along the chosen axis
fn build_axis(route: &Route, interval: SamplingInterval) -> Result<Vec<f64>> {
    match interval {
        SamplingInterval::Distance(_) => Ok(route.cumulative_distances()),
        SamplingInterval::Duration(_) => {
            let mut axis = Vec::with_capacity(route.len());
            let mut start = None;
            for (index, point) in route.points().iter().enumerate() {
                let ts = point.timestamp.ok_or_else(|| {
                    Error::Segmentation(format!(
                        "duration sampling needs timestamps, point {index} has none"
                    ))
                })?;
                let origin = *start.get_or_insert(ts);
                axis.push((ts - origin).num_milliseconds() as f64 / 1000.0);
            }
            Ok(axis)
        }
    }
}

/// Grid positions `0, step, 2*step, ...` up to `total`, closed by `total`
fn build_grid(total: f64, step: f64, max_samples: usize) -> Result<Vec<f64>> {
    let steps = (total / step + GRID_EPSILON).floor();
    if !steps.is_finite() || steps + 1.0 > max_samples as f64 {
        return Err(Error::Segmentation(format!(
            "a {step} interval over {total:.3} needs about {steps:e} samples, more than the limit of {max_samples}"
        )));
    }
    let count = steps as usize;
    let mut grid: Vec<f64> = (0..=count).map(|k| (k as f64 * step).min(total)).collect();
    let last = grid.last().copied().unwrap_or(0.0);
    if total - last > GRID_EPSILON * total.max(1.0) {
        grid.push(total);
    } else if let Some(last) = grid.last_mut() {
        *last = total;
    }
    Ok(grid)
}

/// Bracketing pair for a sample position
///
/// `lower` is the first of the points tied at the greatest axis value not
/// above `s`; `upper` is the first point strictly beyond `s`, if any.
fn bracket(axis: &[f64], s: f64) -> (usize, Option<usize>) {
    let after = axis.partition_point(|&t| t <= s);
    let last_at_or_before = after.saturating_sub(1);
    let tie_value = axis[last_at_or_before];
    let lower = axis.partition_point(|&t| t < tie_value);
    let upper = (after < axis.len()).then_some(after);
    (lower, upper)
}

fn interpolate(a: &Value, b: &Value, f: f64) -> Value {
    if f == 0.0 {
        return a.clone();
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Value::Number((1.0 - f) * x + f * y),
        (Value::Time(x), Value::Time(y)) => {
            let x = x.timestamp_millis() as f64;
            let y = y.timestamp_millis() as f64;
            let millis = ((1.0 - f) * x + f * y).round() as i64;
            Utc.timestamp_millis_opt(millis)
                .single()
                .map(Value::Time)
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

/// Resample a route onto a uniform grid
///
/// Both route endpoints are always represented: the grid runs from 0 to the
/// last multiple of the interval not beyond the route length, closed by a
/// final sample at the route length itself.
pub fn segment(route: &Route, config: &SegmentationConfig, ctx: &RunContext) -> Result<Segmented> {
    let started = ctx.start_stage(Stage::Segmentation);
    if route.len() < 2 {
        return Err(Error::InsufficientData {
            required: 2,
            actual: route.len(),
        });
    }

    let table = Table::from_route(route)?;
    let policies = config.resolve(table.schema())?;
    let axis = build_axis(route, config.interval)?;

    let total = axis.last().copied().unwrap_or(0.0);
    if !(total > axis[0]) {
        return Err(Error::Segmentation(format!(
            "route collapses to a single {} value ({} points)",
            match config.interval {
                SamplingInterval::Distance(_) => "distance",
                SamplingInterval::Duration(_) => "time",
            },
            route.len()
        )));
    }

    let grid = build_grid(total, config.interval.step(), config.max_samples)?;
    let tolerance = config.impulse_tolerance;
    let mut diagnostics = route.diagnostics.clone();
    let mut samples = Vec::with_capacity(grid.len());

    for (k, &s) in grid.iter().enumerate() {
        let (lower, upper) = bracket(&axis, s);
        let f = match upper {
            Some(upper) if axis[upper] > axis[lower] => (s - axis[lower]) / (axis[upper] - axis[lower]),
            _ => 0.0,
        };

        // Points coinciding with the sample, and points inside (previous sample, s]
        let near = axis.partition_point(|&t| t < s - tolerance)..axis.partition_point(|&t| t <= s + tolerance);
        let window = match k {
            0 => near.clone(),
            _ => axis.partition_point(|&t| t <= grid[k - 1])..axis.partition_point(|&t| t <= s),
        };

        let mut values = Vec::with_capacity(policies.len());
        for (c, policy) in policies.iter().enumerate() {
            let column = table.column_at(c);
            let value = match policy {
                InterpolationPolicy::Linear => match upper {
                    Some(upper) => interpolate(&column[lower], &column[upper], f),
                    None => column[lower].clone(),
                },
                InterpolationPolicy::Hold => column[lower].clone(),
                InterpolationPolicy::Impulse => column[near.clone()]
                    .iter()
                    .find(|v| !v.is_null())
                    .cloned()
                    .unwrap_or(Value::Null),
                InterpolationPolicy::Once => {
                    let mut events = column[window.clone()].iter().filter(|v| !v.is_null());
                    let first = events.next().cloned();
                    let dropped = events.count();
                    if dropped > 0 {
                        diagnostics.push(Diagnostic::point(
                            Stage::Segmentation,
                            k,
                            format!(
                                "column '{}': {dropped} further event(s) in the interval ending at {s:.3} were dropped",
                                table.schema()[c].name
                            ),
                        ));
                    }
                    first.unwrap_or(Value::Null)
                }
            };
            values.push(value);
        }
        samples.push(Sample { position: s, values });
    }

    ctx.debug(
        Stage::Segmentation,
        format_args!("{} points -> {} samples over {total:.3}", route.len(), samples.len()),
    );
    ctx.finish_stage(Stage::Segmentation, started, samples.len());

    Ok(Segmented {
        interval: config.interval,
        schema: table.schema().to_vec(),
        policies,
        samples,
        diagnostics,
    })
}
