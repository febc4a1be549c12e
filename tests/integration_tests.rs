//! End-to-end tests for the trackfuse pipeline
//!
//! Every external service is a wiremock server. The map-matching and
//! elevation mocks echo the request so answers always line up with the
//! batch that was sent.

use std::io::Write;

use serde_json::{json, Value as Json};
use tempfile::Builder;
use trackfuse::{Config, EnrichOptions, Error, Pipeline, RunContext, Service, Stage, Value};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// OSRM stand-in: every coordinate matches onto itself
struct EchoMatch;

impl Respond for EchoMatch {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let coordinates = request.url.path().rsplit('/').next().unwrap_or_default();
        let tracepoints: Vec<Json> = coordinates
            .split(';')
            .map(|pair| {
                let (lon, lat) = pair.split_once(',').unwrap();
                json!({
                    "location": [lon.parse::<f64>().unwrap(), lat.parse::<f64>().unwrap()],
                    "distance": 1.5,
                    "matchings_index": 0
                })
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({
            "code": "Ok",
            "matchings": [{"confidence": 0.95}],
            "tracepoints": tracepoints
        }))
    }
}

/// Open-Elevation stand-in: elevation grows with latitude
struct EchoElevation;

impl Respond for EchoElevation {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Json = serde_json::from_slice(&request.body).unwrap();
        let results: Vec<Json> = body["locations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| {
                let lat = l["latitude"].as_f64().unwrap();
                json!({"latitude": lat, "longitude": l["longitude"], "elevation": 100.0 + (lat - 50.0) * 10_000.0})
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "results": results }))
    }
}

struct Services {
    matching: MockServer,
    elevation: MockServer,
    geodata: MockServer,
}

async fn start_services(elevation_up: bool) -> Services {
    let matching = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/match/v1/driving/.+"))
        .respond_with(EchoMatch)
        .mount(&matching)
        .await;

    let elevation = MockServer::start().await;
    if elevation_up {
        Mock::given(method("POST"))
            .and(path("/api/v1/lookup"))
            .respond_with(EchoElevation)
            .mount(&elevation)
            .await;
    } else {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&elevation)
            .await;
    }

    let geodata = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/interpreter"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "elements": [
                {
                    "type": "way",
                    "id": 42,
                    "geometry": [{"lat": 49.99, "lon": 4.0}, {"lat": 50.01, "lon": 4.0}],
                    "tags": {"highway": "residential", "maxspeed": "30 mph"}
                },
                {
                    "type": "node",
                    "id": 7,
                    "lat": 50.0015,
                    "lon": 4.0,
                    "tags": {"highway": "traffic_signals"}
                }
            ]
        })))
        .mount(&geodata)
        .await;

    Services {
        matching,
        elevation,
        geodata,
    }
}

fn config(services: &Services) -> Config {
    let mut config = Config::default();
    config.services.matching_url = services.matching.uri();
    config.services.elevation_url = services.elevation.uri();
    config.services.geodata_url = services.geodata.uri();
    config.services.request_timeout_secs = 5.0;
    config.network.max_retries = 0;
    config.network.parallelism = 2;
    config.matching.batch_size = 3;
    config.metadata.way_columns = vec!["highway".to_string(), "maxspeed".to_string()];
    config.segmentation.duration_s = Some(10.0);
    config
}

/// Six points 5 s apart heading north, plus one null-island fix
fn csv_track() -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(".csv").tempfile().unwrap();
    writeln!(file, ";timestamp;latitude;longitude").unwrap();
    let mut row = 0;
    for i in 0..6 {
        writeln!(file, "{row};{};{};4.0", 1_700_000_000_000i64 + i * 5_000, 50.0 + i as f64 * 0.0005).unwrap();
        row += 1;
        if i == 2 {
            writeln!(file, "{row};{};0.0;0.0", 1_700_000_000_000i64 + i * 5_000).unwrap();
            row += 1;
        }
    }
    file
}

#[tokio::test]
async fn test_pipeline_end_to_end() {
    let services = start_services(true).await;
    let config = config(&services);
    let route = trackfuse::formats::read_route(csv_track().path()).unwrap();
    assert_eq!(route.len(), 7);

    let enrichers = EnrichOptions::from_config(&config.metadata);
    let pipeline = Pipeline::from_config(config, enrichers).unwrap();
    let output = pipeline.run(&route, &RunContext::new("e2e")).await.unwrap();

    // Null island removed, everything else matched in place
    assert_eq!(output.points().len(), 6);
    let table = output.standardized();
    assert!(table.column("matched").unwrap().iter().all(|v| *v == Value::Bool(true)));
    assert_eq!(table.column("match_distance").unwrap()[0], Value::Number(1.5));

    let elevation = table.column("elevation").unwrap();
    assert!((elevation[2].as_f64().unwrap() - 110.0).abs() < 1e-6);

    assert_eq!(table.column("way_id").unwrap()[4], Value::Number(42.0));
    assert_eq!(table.column("way_highway").unwrap()[0], Value::Text("residential".into()));
    let maxspeed = table.column("way_maxspeed").unwrap()[0].as_f64().unwrap();
    assert!((maxspeed - 48.28032).abs() < 1e-6);

    let node_ids = table.column("node_id").unwrap();
    assert_eq!(node_ids[3], Value::Number(7.0));
    assert_eq!(node_ids[2], Value::Null);

    // 25 s of track at 10 s intervals
    let segmented = output.segmented().unwrap();
    assert_eq!(segmented.positions(), vec![0.0, 10.0, 20.0, 25.0]);
    let elevation = segmented.column("elevation").unwrap();
    assert!((elevation[1].as_f64().unwrap() - 110.0).abs() < 1e-6);
    // The signal at 15 s is an impulse and falls between samples
    assert!(segmented.column("node_id").unwrap().iter().all(|v| v.is_null()));
    assert_eq!(segmented.column("way_highway").unwrap()[3], &Value::Text("residential".into()));

    assert!(output.diagnostics().iter().any(|d| d.stage == Stage::Filter));

    let mut buffer = Vec::new();
    trackfuse::formats::write_table(&output.table().unwrap(), &mut buffer).unwrap();
    let text = String::from_utf8(buffer).unwrap();
    let header = text.lines().next().unwrap();
    assert_eq!(
        header,
        "position;latitude;longitude;elevation;timestamp;speed;matched;match_distance;match_confidence;\
         speed_osrm;speed_osrm_filtered;way_id;way_tags;node_id;node_tags;intersection;way_highway;way_maxspeed"
    );
    assert_eq!(text.lines().count(), 5);
}

#[tokio::test]
async fn test_distance_mode_spacing() {
    let services = start_services(true).await;
    let mut config = config(&services);
    config.segmentation.duration_s = None;
    config.segmentation.distance_m = Some(20.0);
    let route = trackfuse::formats::read_route(csv_track().path()).unwrap();

    let pipeline = Pipeline::from_config(config.clone(), EnrichOptions::from_config(&config.metadata)).unwrap();
    let output = pipeline.run(&route, &RunContext::new("distance")).await.unwrap();

    // Five 0.0005 degree steps, roughly 278 m
    let positions = output.segmented().unwrap().positions();
    assert_eq!(positions.len(), 15);
    assert_eq!(positions[0], 0.0);
    for pair in positions[..positions.len() - 1].windows(2) {
        assert!((pair[1] - pair[0] - 20.0).abs() < 1e-9, "{pair:?}");
    }
    let tail = positions[positions.len() - 1] - positions[positions.len() - 2];
    assert!(tail > 0.0 && tail <= 20.0, "{tail}");

    let segmented = output.segmented().unwrap();
    let elevation = segmented.column("elevation").unwrap();
    assert!((elevation[0].as_f64().unwrap() - 100.0).abs() < 1e-6);
    assert!(segmented.column("way_id").unwrap().iter().all(|v| **v == Value::Number(42.0)));
}

#[tokio::test]
async fn test_elevation_outage_degrades_unless_strict() {
    let services = start_services(false).await;
    let mut file = Builder::new().suffix(".gpx").tempfile().unwrap();
    write!(
        file,
        r#"<?xml version="1.0"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><trkseg>
    <trkpt lat="50.0000" lon="4.0"><ele>12.0</ele><time>2023-11-14T22:13:20Z</time></trkpt>
    <trkpt lat="50.0005" lon="4.0"><ele>13.0</ele><time>2023-11-14T22:13:25Z</time></trkpt>
    <trkpt lat="50.0010" lon="4.0"><ele>14.0</ele><time>2023-11-14T22:13:30Z</time></trkpt>
  </trkseg></trk>
</gpx>"#
    )
    .unwrap();

    let output = trackfuse::process_file(file.path(), config(&services)).await.unwrap();
    let table = output.standardized();
    assert_eq!(table.len(), 3);
    assert!(table.column("elevation").unwrap().iter().all(Value::is_null));
    assert!(output
        .diagnostics()
        .iter()
        .any(|d| d.stage == Stage::Elevation && d.message.contains("no elevation")));

    let mut strict = config(&services);
    strict.network.strict = true;
    let err = trackfuse::process_file(file.path(), strict).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ServiceUnavailable {
            service: Service::Elevation,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unknown_policy_column_is_reported_before_any_request() {
    let services = start_services(true).await;
    let mut config = config(&services);
    config
        .segmentation
        .columns
        .insert("way_maxsped".to_string(), trackfuse::InterpolationPolicy::Hold);

    let route = trackfuse::formats::read_route(csv_track().path()).unwrap();
    let pipeline = Pipeline::from_config(config.clone(), EnrichOptions::from_config(&config.metadata)).unwrap();
    let err = pipeline.run(&route, &RunContext::new("e2e")).await.unwrap_err();
    assert!(err.to_string().contains("Did you mean 'way_maxspeed'?"), "{err}");

    assert!(services.matching.received_requests().await.unwrap().is_empty());
    assert!(services.geodata.received_requests().await.unwrap().is_empty());
}
