//! External reference services
//!
//! Each dependency is a trait so stages can run against the HTTP clients in
//! production and in-memory fakes in tests.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, ClientBuilder, Response, StatusCode};

use crate::core::geo::BoundingBox;
use crate::core::model::{Coordinate, TagMap};
use crate::{Error, Result, Service};

pub mod open_elevation;
pub mod osrm;
pub mod overpass;

pub use open_elevation::OpenElevationClient;
pub use osrm::OsrmClient;
pub use overpass::OverpassClient;

/// Snapped position for one input coordinate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedPoint {
    pub position: Coordinate,
    /// Distance between the input and the snapped position, in metres
    pub distance_m: f64,
    /// Confidence of the matching this point belongs to
    pub confidence: f64,
    /// Routed speed (m/s) of the leg leaving this point, or entering it for the last point
    pub speed_mps: Option<f64>,
}

/// Answer for one batch: one entry per input coordinate, `None` when unmatched
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchBatch {
    pub points: Vec<Option<MatchedPoint>>,
    /// Number of separate matchings the service split the batch into
    pub sub_matchings: usize,
}

impl MatchBatch {
    pub fn unmatched(len: usize) -> Self {
        Self {
            points: vec![None; len],
            sub_matchings: 0,
        }
    }
}

pub trait MatchingService: Send + Sync {
    fn match_batch(&self, coordinates: &[Coordinate]) -> impl Future<Output = Result<MatchBatch>> + Send;
}

pub trait ElevationService: Send + Sync {
    /// Elevation in metres per coordinate, in request order
    fn lookup(&self, coordinates: &[Coordinate]) -> impl Future<Output = Result<Vec<Option<f64>>>> + Send;
}

/// Road segment with its geometry
#[derive(Debug, Clone, PartialEq)]
pub struct Way {
    pub id: i64,
    pub geometry: Vec<Coordinate>,
    /// Node ids along the way, parallel to `geometry` when present
    pub nodes: Vec<i64>,
    pub tags: TagMap,
}

/// Point feature
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub position: Coordinate,
    pub tags: TagMap,
}

/// Ways and nodes inside one bounding box
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeodataExtract {
    pub ways: Vec<Way>,
    pub nodes: Vec<Node>,
}

pub trait GeodataService: Send + Sync {
    fn query_bbox(&self, bbox: BoundingBox) -> impl Future<Output = Result<GeodataExtract>> + Send;
}

/// HTTP client shared by all requests of one service client
pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    ClientBuilder::new()
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .user_agent(format!("trackfuse/{}", env!("TRACKFUSE_VERSION")))
        .build()
        .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {e}")))
}

/// Error for a non-success status: throttling and server errors are transient
pub(crate) fn status_error(service: Service, status: StatusCode, body: &str) -> Error {
    let detail = body.trim();
    let detail = if detail.len() > 200 {
        format!("{}...", detail.chars().take(200).collect::<String>())
    } else {
        detail.to_string()
    };
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::ServiceUnavailable { service, message }
    } else {
        Error::ServiceRejected { service, message }
    }
}

/// Read a response body as text, classifying transport failures
pub(crate) async fn read_body(service: Service, response: Response) -> Result<(StatusCode, String)> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::transport(service, e))?;
    Ok((status, body))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(service: Service, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::ServiceRejected {
        service,
        message: format!("malformed response: {e}"),
    })
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
