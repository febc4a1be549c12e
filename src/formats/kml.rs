//! KML reader
//!
//! Every placemark contributes its `LineString` coordinates and its
//! `gx:Track` samples, in document order. LineString altitudes are dropped
//! since KML writers mostly emit a clamped zero there; `gx:coord` altitudes
//! and `when` timestamps are kept.

use roxmltree::Node;

use super::{parse_number, parse_timestamp, parse_xml, xml_text};
use crate::core::model::{Route, TrackPoint};
use crate::{Error, Result};

fn is(node: &Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

/// `lon,lat[,alt]` tuples separated by whitespace
fn line_coordinates(text: &str) -> Result<Vec<TrackPoint>> {
    text.split_whitespace()
        .map(|tuple| {
            let mut parts = tuple.split(',');
            match (parts.next(), parts.next()) {
                (Some(lon), Some(lat)) => Ok(TrackPoint::new(
                    parse_number(lat, "coordinates")?,
                    parse_number(lon, "coordinates")?,
                )),
                _ => Err(Error::Parse(format!("coordinates: malformed tuple '{tuple}'"))),
            }
        })
        .collect()
}

/// `gx:coord` is `lon lat [alt]`, paired by position with the `when` elements
fn track(node: Node) -> Result<Vec<TrackPoint>> {
    let whens: Vec<&str> = node
        .children()
        .filter(|c| is(c, "when"))
        .map(|c| c.text().unwrap_or("").trim())
        .collect();
    let coords: Vec<&str> = node
        .children()
        .filter(|c| is(c, "coord"))
        .map(|c| c.text().unwrap_or(""))
        .collect();
    if !whens.is_empty() && whens.len() != coords.len() {
        return Err(Error::Parse(format!(
            "gx:Track has {} when elements but {} coordinates",
            whens.len(),
            coords.len()
        )));
    }

    coords
        .iter()
        .enumerate()
        .map(|(i, coord)| {
            let values = coord
                .split_whitespace()
                .map(|v| parse_number(v, "gx:coord"))
                .collect::<Result<Vec<f64>>>()?;
            let (lon, lat) = match values[..] {
                [lon, lat, ..] => (lon, lat),
                _ => return Err(Error::Parse(format!("gx:coord: malformed value '{coord}'"))),
            };
            let mut point = TrackPoint::new(lat, lon);
            point.elevation = values.get(2).copied();
            if let Some(when) = whens.get(i) {
                point.timestamp = Some(parse_timestamp(when)?);
            }
            Ok(point)
        })
        .collect()
}

pub fn parse(content: &str, id: &str) -> Result<Route> {
    let document = parse_xml(content, "KML")?;
    let root = document.root_element();

    let mut points = Vec::new();
    for placemark in root.descendants().filter(|n| is(n, "Placemark")) {
        for geometry in placemark.descendants() {
            if is(&geometry, "LineString") {
                if let Some(text) = xml_text(geometry, "coordinates") {
                    points.extend(line_coordinates(text)?);
                }
            } else if is(&geometry, "Track") {
                points.extend(track(geometry)?);
            }
        }
    }
    if points.is_empty() {
        return Err(Error::Parse(
            "KML document has no LineString or gx:Track coordinates".to_string(),
        ));
    }

    let name = root
        .descendants()
        .filter(|n| is(n, "Document") || is(n, "Placemark"))
        .find_map(|n| xml_text(n, "name"))
        .filter(|name| !name.is_empty());

    let route = Route::new(id, points)?;
    Ok(match name {
        Some(name) => route.with_name(name),
        None => route,
    })
}
