//! TCX reader
//!
//! Trackpoints of every activity lap and course are read in document order.
//! Trackpoints without a `Position` (heart rate only samples) are skipped.

use super::{parse_number, parse_timestamp, parse_xml, xml_child, xml_text};
use crate::core::model::{Route, TrackPoint};
use crate::{Error, Result};

fn trackpoint(node: roxmltree::Node) -> Result<Option<TrackPoint>> {
    let Some(position) = xml_child(node, "Position") else {
        return Ok(None);
    };
    let coordinate = |field: &str| {
        xml_text(position, field)
            .ok_or_else(|| Error::Parse(format!("Position without {field}")))
            .and_then(|raw| parse_number(raw, field))
    };
    let mut point = TrackPoint::new(coordinate("LatitudeDegrees")?, coordinate("LongitudeDegrees")?);
    point.elevation = xml_text(node, "AltitudeMeters")
        .map(|raw| parse_number(raw, "AltitudeMeters"))
        .transpose()?;
    point.timestamp = xml_text(node, "Time").map(parse_timestamp).transpose()?;
    // ActivityExtension TPX/Speed
    point.speed = node
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Speed")
        .and_then(|n| n.text())
        .map(|raw| parse_number(raw, "Speed"))
        .transpose()?;
    Ok(Some(point))
}

pub fn parse(content: &str, id: &str) -> Result<Route> {
    let document = parse_xml(content, "TCX")?;

    let mut points = Vec::new();
    for node in document
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Trackpoint")
    {
        points.extend(trackpoint(node)?);
    }
    if points.is_empty() {
        return Err(Error::Parse("TCX document has no trackpoints with a position".to_string()));
    }

    let name = document
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Course")
        .find_map(|course| xml_text(course, "Name"))
        .filter(|name| !name.is_empty());

    let route = Route::new(id, points)?;
    Ok(match name {
        Some(name) => route.with_name(name),
        None => route,
    })
}
