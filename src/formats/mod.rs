//! Track file readers and table writers
//!
//! Readers turn a file into a canonical [`Route`]; the format is picked from
//! the file extension.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::core::model::Route;
use crate::{Error, Result};

pub mod geojson;
pub mod gpx_reader;
pub mod kml;
pub mod route_json;
pub mod tabular;
pub mod tcx;

pub use tabular::write_table;

/// Supported track file families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Gpx,
    Kml,
    Tcx,
    GeoJson,
    Csv,
    Json,
}

impl Format {
    /// Format from the file extension (case-insensitive)
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "gpx" => Ok(Format::Gpx),
            "kml" => Ok(Format::Kml),
            "tcx" => Ok(Format::Tcx),
            "geojson" => Ok(Format::GeoJson),
            "csv" | "txt" => Ok(Format::Csv),
            "json" => Ok(Format::Json),
            "" => Err(Error::Parse(format!(
                "cannot detect the format of '{}' without a file extension",
                path.display()
            ))),
            other => Err(Error::Parse(format!(
                "unsupported file extension '.{other}' (expected gpx, kml, tcx, geojson, csv or json)"
            ))),
        }
    }
}

/// Route identifier derived from the file name
fn route_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("route")
        .to_string()
}

/// Read and parse a track file
pub fn read_route(path: impl AsRef<Path>) -> Result<Route> {
    let path = path.as_ref();
    let format = Format::from_path(path)?;
    let content = fs::read_to_string(path)?;
    parse_route(format, &content, &route_id(path))
}

/// Parse track content of a known format
pub fn parse_route(format: Format, content: &str, id: &str) -> Result<Route> {
    match format {
        Format::Gpx => gpx_reader::parse(content, id),
        Format::GeoJson => geojson::parse(content, id),
        Format::Csv => tabular::parse(content, id),
        Format::Json => {
            // GeoJSON documents are often saved as plain .json
            if geojson::looks_like_geojson(content) {
                geojson::parse(content, id)
            } else {
                route_json::parse(content, id)
            }
        }
        Format::Kml => kml::parse(content, id),
        Format::Tcx => tcx::parse(content, id),
    }
}

pub(crate) fn parse_xml<'input>(content: &'input str, kind: &str) -> Result<roxmltree::Document<'input>> {
    roxmltree::Document::parse(content).map_err(|e| Error::Parse(format!("invalid {kind}: {e}")))
}

/// First child element with the given local name, whatever its namespace
pub(crate) fn xml_child<'a, 'input>(node: roxmltree::Node<'a, 'input>, name: &str) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|c| c.is_element() && c.tag_name().name() == name)
}

/// Trimmed text of a child element
pub(crate) fn xml_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    xml_child(node, name).and_then(|c| c.text()).map(str::trim)
}

pub(crate) fn parse_number(raw: &str, field: &str) -> Result<f64> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Parse(format!("{field}: '{raw}' is not a number")))
}

/// Timestamp from unix milliseconds, RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS[.f]` in UTC
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| Error::Parse(format!("timestamp {millis} is out of range")));
    }
    if let Ok(millis) = raw.parse::<f64>() {
        if millis.is_finite() {
            return parse_timestamp(&format!("{}", millis.round() as i64));
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Ok(naive.and_utc());
        }
    }
    Err(Error::Parse(format!("unrecognised timestamp '{raw}'")))
}
