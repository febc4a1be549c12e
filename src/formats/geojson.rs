//! GeoJSON tracks
//!
//! Point, LineString and MultiLineString geometries are read in feature
//! order. Per-vertex times come from a `coordTimes` or `times` property.

use serde::Deserialize;
use serde_json::Value as Json;

use crate::core::model::{Route, TrackPoint};
use crate::formats::parse_timestamp;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Document {
    FeatureCollection { features: Vec<Feature> },
    Feature(Feature),
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
    #[serde(default)]
    properties: Option<serde_json::Map<String, Json>>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Json,
}

fn coordinates<T: serde::de::DeserializeOwned>(geometry: &Geometry) -> Result<T> {
    serde_json::from_value(geometry.coordinates.clone())
        .map_err(|e| Error::Parse(format!("invalid {} coordinates: {e}", geometry.kind)))
}

/// Cheap check used to route `.json` files
pub fn looks_like_geojson(content: &str) -> bool {
    serde_json::from_str::<Json>(content)
        .ok()
        .and_then(|doc| doc.get("type").and_then(Json::as_str).map(str::to_string))
        .is_some_and(|kind| kind == "FeatureCollection" || kind == "Feature")
}

fn vertex(position: &[f64]) -> Result<TrackPoint> {
    match position {
        [lon, lat] => Ok(TrackPoint::new(*lat, *lon)),
        [lon, lat, ele, ..] => Ok(TrackPoint::new(*lat, *lon).with_elevation(*ele)),
        _ => Err(Error::Parse(format!("position needs at least 2 values, got {}", position.len()))),
    }
}

/// Per-vertex times, flattened across lines
fn times(properties: &serde_json::Map<String, Json>) -> Vec<Option<String>> {
    let raw = properties.get("coordTimes").or_else(|| properties.get("times"));
    let mut flat = Vec::new();
    let mut push = |value: &Json| match value {
        Json::String(s) => flat.push(Some(s.clone())),
        Json::Number(n) => flat.push(Some(n.to_string())),
        _ => flat.push(None),
    };
    if let Some(Json::Array(items)) = raw {
        for item in items {
            match item {
                Json::Array(inner) => inner.iter().for_each(&mut push),
                other => push(other),
            }
        }
    }
    flat
}

fn feature_points(feature: &Feature) -> Result<Vec<TrackPoint>> {
    let Some(geometry) = &feature.geometry else {
        return Ok(Vec::new());
    };
    let mut points: Vec<TrackPoint> = match geometry.kind.as_str() {
        "Point" => vec![vertex(&coordinates::<Vec<f64>>(geometry)?)?],
        "LineString" => coordinates::<Vec<Vec<f64>>>(geometry)?
            .iter()
            .map(|p| vertex(p))
            .collect::<Result<_>>()?,
        "MultiLineString" => coordinates::<Vec<Vec<Vec<f64>>>>(geometry)?
            .iter()
            .flatten()
            .map(|p| vertex(p))
            .collect::<Result<_>>()?,
        _ => Vec::new(),
    };

    if let Some(properties) = &feature.properties {
        let times = times(properties);
        if !times.is_empty() && times.len() != points.len() {
            return Err(Error::Parse(format!(
                "{} times for {} coordinates",
                times.len(),
                points.len()
            )));
        }
        for (point, time) in points.iter_mut().zip(times) {
            if let Some(time) = time {
                point.timestamp = Some(parse_timestamp(&time)?);
            }
        }
        // Point features carry their time as a plain property
        if let (1, Some(time)) = (points.len(), properties.get("time").and_then(Json::as_str)) {
            points[0].timestamp = Some(parse_timestamp(time)?);
        }
    }
    Ok(points)
}

pub fn parse(content: &str, id: &str) -> Result<Route> {
    let document: Document =
        serde_json::from_str(content).map_err(|e| Error::Parse(format!("invalid GeoJSON: {e}")))?;
    let features = match document {
        Document::FeatureCollection { features } => features,
        Document::Feature(feature) => vec![feature],
    };

    let mut points = Vec::new();
    let mut name = None;
    for feature in &features {
        points.extend(feature_points(feature)?);
        if name.is_none() {
            name = feature
                .properties
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Json::as_str)
                .map(str::to_string);
        }
    }

    let route = Route::new(id, points)?;
    Ok(match name {
        Some(name) => route.with_name(name),
        None => route,
    })
}
