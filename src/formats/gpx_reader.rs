//! GPX reader
//!
//! Track points are used when present, otherwise waypoints, otherwise route
//! points. All track segments are concatenated in document order.

use chrono::{DateTime, Utc};
use time::OffsetDateTime;

use crate::core::model::{Route, TrackPoint};
use crate::{Error, Result};

fn convert_time(time: gpx::Time) -> Option<DateTime<Utc>> {
    let time: OffsetDateTime = time.into();
    DateTime::from_timestamp(time.unix_timestamp(), time.nanosecond())
}

fn convert(waypoint: &gpx::Waypoint) -> TrackPoint {
    let position = waypoint.point();
    let mut point = TrackPoint::new(position.y(), position.x());
    point.elevation = waypoint.elevation;
    point.timestamp = waypoint.time.and_then(convert_time);
    point.speed = waypoint.speed;
    point
}

pub fn parse(content: &str, id: &str) -> Result<Route> {
    let document = gpx::read(content.as_bytes()).map_err(|e| Error::Parse(format!("invalid GPX: {e}")))?;

    let track_points: Vec<&gpx::Waypoint> = document
        .tracks
        .iter()
        .flat_map(|track| track.segments.iter())
        .flat_map(|segment| segment.points.iter())
        .collect();
    let route_points: Vec<&gpx::Waypoint> = document.routes.iter().flat_map(|r| r.points.iter()).collect();

    let source = if !track_points.is_empty() {
        track_points
    } else if !document.waypoints.is_empty() {
        document.waypoints.iter().collect()
    } else {
        route_points
    };
    if source.is_empty() {
        return Err(Error::Parse("GPX document has no track, waypoint or route points".to_string()));
    }

    let name = document
        .tracks
        .iter()
        .find_map(|t| t.name.clone())
        .or_else(|| document.metadata.as_ref().and_then(|m| m.name.clone()));

    let route = Route::new(id, source.into_iter().map(convert).collect())?;
    Ok(match name {
        Some(name) => route.with_name(name),
        None => route,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TRACK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <wpt lat="10.0" lon="10.0"><name>ignored</name></wpt>
  <trk>
    <name>Morning ride</name>
    <trkseg>
      <trkpt lat="50.8466" lon="4.3528"><ele>56.0</ele><time>2023-11-14T22:13:20Z</time></trkpt>
      <trkpt lat="50.8470" lon="4.3535"><ele>57.5</ele><time>2023-11-14T22:13:25Z</time></trkpt>
    </trkseg>
    <trkseg>
      <trkpt lat="50.8475" lon="4.3541"><time>2023-11-14T22:13:30Z</time></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn test_track_points_preferred() {
        let route = parse(TRACK, "ride").unwrap();
        assert_eq!(route.len(), 3);
        assert_eq!(route.name.as_deref(), Some("Morning ride"));

        let first = &route.points()[0];
        assert_eq!(first.latitude, 50.8466);
        assert_eq!(first.longitude, 4.3528);
        assert_eq!(first.elevation, Some(56.0));
        assert_eq!(first.timestamp, Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        assert_eq!(route.points()[2].elevation, None);
    }

    #[test]
    fn test_falls_back_to_waypoints() {
        let content = r#"<?xml version="1.0"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <wpt lat="50.0" lon="4.0"/>
  <wpt lat="50.1" lon="4.1"/>
</gpx>"#;
        let route = parse(content, "w").unwrap();
        assert_eq!(route.len(), 2);
        assert_eq!(route.points()[1].latitude, 50.1);
    }

    #[test]
    fn test_empty_and_invalid_documents() {
        let empty = r#"<?xml version="1.0"?><gpx version="1.1" creator="test"></gpx>"#;
        assert!(matches!(parse(empty, "e"), Err(Error::Parse(_))));
        assert!(matches!(parse("not xml at all", "e"), Err(Error::Parse(_))));
    }
}
