//! Structured JSON tracks: a bare point list, or named segments of points

use serde::Deserialize;
use serde_json::Value as Json;

use crate::core::model::{Route, TrackPoint, Value};
use crate::formats::parse_timestamp;
use crate::{Error, Result};

pub const SEGMENT_COLUMN: &str = "segment";

#[derive(Debug, Deserialize)]
struct RawPoint {
    #[serde(default)]
    time: Option<Json>,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    elevation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    #[serde(default)]
    name: Option<String>,
    points: Vec<RawPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Document {
    Points(Vec<RawPoint>),
    Segments {
        #[serde(default)]
        name: Option<String>,
        segments: Vec<RawSegment>,
    },
}

fn convert(raw: &RawPoint, segment: Option<&str>) -> Result<TrackPoint> {
    let mut point = TrackPoint::new(raw.latitude, raw.longitude);
    point.speed = raw.speed;
    point.elevation = raw.elevation;
    point.timestamp = match &raw.time {
        None | Some(Json::Null) => None,
        Some(Json::String(s)) => Some(parse_timestamp(s)?),
        Some(Json::Number(n)) => Some(parse_timestamp(&n.to_string())?),
        Some(other) => return Err(Error::Parse(format!("unsupported time value {other}"))),
    };
    if let Some(segment) = segment {
        point
            .attributes
            .insert(SEGMENT_COLUMN.to_string(), Value::Text(segment.to_string()));
    }
    Ok(point)
}

pub fn parse(content: &str, id: &str) -> Result<Route> {
    let document: Document = serde_json::from_str(content).map_err(|e| {
        Error::Parse(format!(
            "expected a point list or a {{name, segments}} document: {e}"
        ))
    })?;

    match document {
        Document::Points(points) => {
            let points = points.iter().map(|p| convert(p, None)).collect::<Result<_>>()?;
            Route::new(id, points)
        }
        Document::Segments { name, segments } => {
            let mut points = Vec::new();
            for (index, segment) in segments.iter().enumerate() {
                let label = segment.name.clone().unwrap_or_else(|| index.to_string());
                for raw in &segment.points {
                    points.push(convert(raw, Some(&label))?);
                }
            }
            let route = Route::new(id, points)?;
            Ok(match name {
                Some(name) => route.with_name(name),
                None => route,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_point_list() {
        let content = r#"[
            {"time": 1700000000000, "latitude": 50.0, "longitude": 4.0, "speed": 5.2},
            {"time": "2023-11-14T22:13:21Z", "latitude": 50.001, "longitude": 4.001, "speed": 5.4}
        ]"#;
        let route = parse(content, "j").unwrap();
        assert_eq!(route.len(), 2);
        assert_eq!(route.points()[0].timestamp, Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        assert_eq!(route.points()[1].speed, Some(5.4));
        assert!(route.points()[0].attributes.is_empty());
    }

    #[test]
    fn test_named_segments() {
        let content = r#"{
            "name": "Tour",
            "segments": [
                {"name": "climb", "points": [{"latitude": 45.0, "longitude": 6.0}]},
                {"points": [{"latitude": 45.1, "longitude": 6.1, "time": null}]}
            ]
        }"#;
        let route = parse(content, "j").unwrap();
        assert_eq!(route.name.as_deref(), Some("Tour"));
        assert_eq!(route.points()[0].value(SEGMENT_COLUMN), Value::Text("climb".into()));
        assert_eq!(route.points()[1].value(SEGMENT_COLUMN), Value::Text("1".into()));
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(parse(r#"{"points": 3}"#, "j"), Err(Error::Parse(_))));
        let backwards = r#"[
            {"time": 1700000001000, "latitude": 50.0, "longitude": 4.0},
            {"time": 1700000000000, "latitude": 50.1, "longitude": 4.1}
        ]"#;
        assert!(matches!(parse(backwards, "j"), Err(Error::Parse(_))));
    }
}
