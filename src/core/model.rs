//! Canonical route model shared by every pipeline stage
//!
//! A [`Route`] is created once by a format adapter and then passed by
//! reference through each stage; every stage builds a new route instead of
//! mutating its input.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::geo::haversine_distance;
use crate::{Error, Result};

/// Key-value tags of a way or node
pub type TagMap = BTreeMap<String, String>;

/// Column name -> value mapping produced by enrichers
pub type ColumnMap = BTreeMap<String, Value>;

/// Base columns carried by every point, in output order
pub const BASE_COLUMNS: [&str; 5] = ["latitude", "longitude", "elevation", "timestamp", "speed"];

/// Type of a column in the standardized table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    Text,
    Flag,
    Tags,
    Time,
}

impl ColumnType {
    /// Numeric columns can be interpolated
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Number | ColumnType::Time)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Number => "number",
            ColumnType::Text => "text",
            ColumnType::Flag => "flag",
            ColumnType::Tags => "tags",
            ColumnType::Time => "time",
        };
        f.write_str(name)
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Time(DateTime<Utc>),
    Tags(TagMap),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type of the value, `None` for null
    pub fn kind(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Flag),
            Value::Number(_) => Some(ColumnType::Number),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Time(_) => Some(ColumnType::Time),
            Value::Tags(_) => Some(ColumnType::Tags),
        }
    }

    /// Numeric view used for interpolation; timestamps map to epoch milliseconds
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            Value::Time(t) => Some(t.timestamp_millis() as f64),
            _ => None,
        }
    }

    pub fn as_tags(&self) -> Option<&TagMap> {
        match self {
            Value::Tags(tags) => Some(tags),
            _ => None,
        }
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map(Value::Number).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Tags(tags) => {
                let mut first = true;
                for (key, value) in tags {
                    if !first {
                        f.write_str("|")?;
                    }
                    write!(f, "{key}={value}")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

/// WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Inside the WGS84 range and finite
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// The (0, 0) sentinel written by receivers without a fix
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

/// One recorded position with its attributes
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Instantaneous speed in m/s
    pub speed: Option<f64>,
    pub attributes: BTreeMap<String, Value>,
}

impl TrackPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation: None,
            timestamp: None,
            speed: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_attribute(mut self, column: &str, value: Value) -> Self {
        self.attributes.insert(column.to_string(), value);
        self
    }

    pub fn position(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Value of a base or attribute column, `Null` when absent
    pub fn value(&self, column: &str) -> Value {
        match column {
            "latitude" => Value::Number(self.latitude),
            "longitude" => Value::Number(self.longitude),
            "elevation" => self.elevation.into(),
            "timestamp" => self.timestamp.map(Value::Time).unwrap_or(Value::Null),
            "speed" => self.speed.into(),
            _ => self.attributes.get(column).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Pipeline stage, used to tag diagnostics and log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Parse,
    Filter,
    Match,
    Metadata,
    Elevation,
    Segmentation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parse => "parse",
            Stage::Filter => "filter",
            Stage::Match => "match",
            Stage::Metadata => "metadata",
            Stage::Elevation => "elevation",
            Stage::Segmentation => "segmentation",
        };
        f.write_str(name)
    }
}

/// A recoverable problem recorded instead of failing the run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub stage: Stage,
    /// Point (or sample) index the problem applies to, `None` for route-wide issues
    pub index: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn route(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            index: None,
            message: message.into(),
        }
    }

    pub fn point(stage: Stage, index: usize, message: impl Into<String>) -> Self {
        Self {
            stage,
            index: Some(index),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "[{}] point {}: {}", self.stage, index, self.message),
            None => write!(f, "[{}] {}", self.stage, self.message),
        }
    }
}

/// Ordered point sequence with route-level metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub id: String,
    pub name: Option<String>,
    points: Vec<TrackPoint>,
    pub diagnostics: Vec<Diagnostic>,
    /// Attribute columns holding momentary events rather than continuous values
    pub event_columns: BTreeSet<String>,
    /// Attribute columns holding labels such as OSM ids, never interpolated
    pub categorical_columns: BTreeSet<String>,
    /// Attribute columns declared by stages, in output order
    pub declared_columns: Vec<(String, ColumnType)>,
}

impl Route {
    /// Build a route, rejecting timestamps that go backwards
    pub fn new(id: impl Into<String>, points: Vec<TrackPoint>) -> Result<Self> {
        let mut last = None;
        for (index, point) in points.iter().enumerate() {
            if let Some(ts) = point.timestamp {
                if let Some(prev) = last {
                    if ts < prev {
                        return Err(Error::Parse(format!(
                            "timestamp at point {index} ({}) is earlier than the previous one ({})",
                            ts.to_rfc3339(),
                            prev.to_rfc3339()
                        )));
                    }
                }
                last = Some(ts);
            }
        }

        Ok(Self {
            id: id.into(),
            name: None,
            points,
            diagnostics: Vec::new(),
            event_columns: BTreeSet::new(),
            categorical_columns: BTreeSet::new(),
            declared_columns: Vec::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// New route carrying this route's metadata and the given points
    ///
    /// Used by stages that only drop or annotate points, so ordering is
    /// already guaranteed by the input.
    pub fn derive(&self, points: Vec<TrackPoint>) -> Route {
        Route {
            id: self.id.clone(),
            name: self.name.clone(),
            points,
            diagnostics: self.diagnostics.clone(),
            event_columns: self.event_columns.clone(),
            categorical_columns: self.categorical_columns.clone(),
            declared_columns: self.declared_columns.clone(),
        }
    }

    /// Declare an attribute column so it keeps its type and place even when all-null
    pub fn declare_column(&mut self, name: &str, kind: ColumnType) {
        if !self.declared_columns.iter().any(|(existing, _)| existing == name) {
            self.declared_columns.push((name.to_string(), kind));
        }
    }

    /// Declare an event column (momentary values, defaulting to impulse sampling)
    pub fn declare_event_column(&mut self, name: &str, kind: ColumnType) {
        self.declare_column(name, kind);
        self.event_columns.insert(name.to_string());
    }

    /// Mark a declared column as a label: held or emitted, never interpolated
    pub fn mark_categorical(&mut self, name: &str) {
        self.categorical_columns.insert(name.to_string());
    }

    /// Cumulative great-circle distance from the first point, in metres
    pub fn cumulative_distances(&self) -> Vec<f64> {
        let mut total = 0.0;
        let mut result = Vec::with_capacity(self.points.len());
        for (i, point) in self.points.iter().enumerate() {
            if i > 0 {
                total += haversine_distance(self.points[i - 1].position(), point.position());
            }
            result.push(total);
        }
        result
    }

    /// Positions of all points
    pub fn coordinates(&self) -> Vec<Coordinate> {
        self.points.iter().map(TrackPoint::position).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_route_rejects_decreasing_timestamps() {
        let points = vec![
            TrackPoint::new(50.0, 4.0).with_timestamp(at(10)),
            TrackPoint::new(50.001, 4.0).with_timestamp(at(5)),
        ];
        let err = Route::new("r", points).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_route_accepts_equal_and_missing_timestamps() {
        let points = vec![
            TrackPoint::new(50.0, 4.0).with_timestamp(at(10)),
            TrackPoint::new(50.001, 4.0),
            TrackPoint::new(50.002, 4.0).with_timestamp(at(10)),
        ];
        assert!(Route::new("r", points).is_ok());
    }

    #[test]
    fn test_cumulative_distance_is_monotonic() {
        let points = vec![
            TrackPoint::new(50.0, 4.0),
            TrackPoint::new(50.001, 4.0),
            TrackPoint::new(50.001, 4.0),
            TrackPoint::new(50.0, 4.0),
        ];
        let route = Route::new("r", points).unwrap();
        let distances = route.cumulative_distances();
        assert_eq!(distances[0], 0.0);
        assert!(distances.windows(2).all(|w| w[1] >= w[0]));
        // ~111 m per 0.001 degree of latitude, out and back
        assert!((distances[3] - 222.4).abs() < 1.0);
    }

    #[test]
    fn test_point_value_lookup() {
        let point = TrackPoint::new(1.0, 2.0)
            .with_speed(3.0)
            .with_attribute("surface", Value::Text("asphalt".into()));
        assert_eq!(point.value("latitude"), Value::Number(1.0));
        assert_eq!(point.value("speed"), Value::Number(3.0));
        assert_eq!(point.value("elevation"), Value::Null);
        assert_eq!(point.value("surface"), Value::Text("asphalt".into()));
        assert_eq!(point.value("missing"), Value::Null);
    }

    #[test]
    fn test_coordinate_validity() {
        assert!(Coordinate::new(90.0, -180.0).is_valid());
        assert!(!Coordinate::new(90.5, 0.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
        assert!(Coordinate::new(0.0, 0.0).is_null_island());
    }

    #[test]
    fn test_tags_display() {
        let mut tags = TagMap::new();
        tags.insert("highway".into(), "residential".into());
        tags.insert("maxspeed".into(), "30".into());
        assert_eq!(Value::Tags(tags).to_string(), "highway=residential|maxspeed=30");
    }
}
