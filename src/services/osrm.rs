//! OSRM `match` service client

use reqwest::Client;
use serde::Deserialize;

use crate::core::config::ServicesConfig;
use crate::core::model::Coordinate;
use crate::services::{decode, http_client, join_url, read_body, status_error, MatchBatch, MatchedPoint, MatchingService};
use crate::{Error, Result, Service};

/// Search radius (m) used when the default radius finds no match
const RELAXED_RADIUS_M: u32 = 100;

#[derive(Debug, Deserialize)]
struct MatchResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    matchings: Vec<Matching>,
    #[serde(default)]
    tracepoints: Vec<Option<Tracepoint>>,
}

#[derive(Debug, Deserialize)]
struct Matching {
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    legs: Vec<Leg>,
}

/// Route between two consecutive waypoints of a matching
#[derive(Debug, Deserialize)]
struct Leg {
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    annotation: Option<Annotation>,
}

/// Per-edge values along a leg
#[derive(Debug, Deserialize)]
struct Annotation {
    #[serde(default)]
    distance: Vec<f64>,
    #[serde(default)]
    duration: Vec<f64>,
}

impl Leg {
    /// Average routed speed in m/s; zero for legs without length or duration
    fn speed(&self) -> f64 {
        let (distance, duration) = match &self.annotation {
            Some(a) if !a.duration.is_empty() => (a.distance.iter().sum(), a.duration.iter().sum()),
            _ => (self.distance, self.duration),
        };
        if distance > 0.0 && duration > 0.0 {
            distance / duration
        } else {
            0.0
        }
    }
}

#[derive(Debug, Deserialize)]
struct Tracepoint {
    /// `[longitude, latitude]`
    location: [f64; 2],
    #[serde(default)]
    distance: f64,
    matchings_index: usize,
    #[serde(default)]
    waypoint_index: Option<usize>,
}

/// Codes meaning "answered, but nothing matched"
fn is_no_match(code: &str) -> bool {
    matches!(code, "NoMatch" | "NoSegment")
}

#[derive(Debug, Clone)]
pub struct OsrmClient {
    client: Client,
    base_url: String,
    profile: String,
}

impl OsrmClient {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout())?,
            base_url: config.matching_url.clone(),
            profile: config.matching_profile.clone(),
        })
    }

    fn url(&self, coordinates: &[Coordinate]) -> String {
        let path = coordinates
            .iter()
            .map(|c| format!("{:.7},{:.7}", c.longitude, c.latitude))
            .collect::<Vec<_>>()
            .join(";");
        join_url(&self.base_url, &format!("match/v1/{}/{}", self.profile, path))
    }

    async fn request(&self, coordinates: &[Coordinate], radius: Option<u32>) -> Result<MatchResponse> {
        let mut query = vec![
            ("gaps", "ignore".to_string()),
            ("tidy", "false".to_string()),
            ("overview", "false".to_string()),
            ("annotations", "distance,duration".to_string()),
        ];
        if let Some(radius) = radius {
            let radiuses = vec![radius.to_string(); coordinates.len()].join(";");
            query.push(("radiuses", radiuses));
        }

        let response = self
            .client
            .get(self.url(coordinates))
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::transport(Service::Matching, e))?;
        let (status, body) = read_body(Service::Matching, response).await?;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(status_error(Service::Matching, status, &body));
        }
        // OSRM reports NoMatch with a 400 status and a JSON body
        match decode::<MatchResponse>(Service::Matching, &body) {
            Ok(parsed) if parsed.code == "Ok" || is_no_match(&parsed.code) => Ok(parsed),
            Ok(parsed) => Err(Error::ServiceRejected {
                service: Service::Matching,
                message: format!(
                    "{}: {}",
                    parsed.code,
                    parsed.message.unwrap_or_default()
                ),
            }),
            Err(_) if !status.is_success() => Err(status_error(Service::Matching, status, &body)),
            Err(e) => Err(e),
        }
    }

    fn convert(coordinates: &[Coordinate], response: MatchResponse) -> Result<MatchBatch> {
        if response.tracepoints.len() != coordinates.len() {
            return Err(Error::ServiceRejected {
                service: Service::Matching,
                message: format!(
                    "{} tracepoints returned for {} coordinates",
                    response.tracepoints.len(),
                    coordinates.len()
                ),
            });
        }

        let points = response
            .tracepoints
            .iter()
            .map(|tracepoint| {
                tracepoint.as_ref().map(|tp| {
                    let matching = response.matchings.get(tp.matchings_index);
                    let speed_mps = matching.zip(tp.waypoint_index).and_then(|(m, w)| {
                        m.legs
                            .get(w)
                            .or_else(|| w.checked_sub(1).and_then(|prev| m.legs.get(prev)))
                            .map(Leg::speed)
                    });
                    MatchedPoint {
                        position: Coordinate::new(tp.location[1], tp.location[0]),
                        distance_m: tp.distance,
                        confidence: matching.map(|m| m.confidence).unwrap_or(0.0),
                        speed_mps,
                    }
                })
            })
            .collect();

        Ok(MatchBatch {
            points,
            sub_matchings: response.matchings.len(),
        })
    }
}

impl MatchingService for OsrmClient {
    async fn match_batch(&self, coordinates: &[Coordinate]) -> Result<MatchBatch> {
        let mut response = self.request(coordinates, None).await?;
        if is_no_match(&response.code) {
            log::debug!(
                "no match for {} coordinates, retrying with {RELAXED_RADIUS_M} m radius",
                coordinates.len()
            );
            response = self.request(coordinates, Some(RELAXED_RADIUS_M)).await?;
            if is_no_match(&response.code) {
                return Ok(MatchBatch::unmatched(coordinates.len()));
            }
        }
        Self::convert(coordinates, response)
    }
}
