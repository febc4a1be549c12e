//! Open-Elevation bulk lookup client

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::config::ServicesConfig;
use crate::core::model::Coordinate;
use crate::services::{decode, http_client, join_url, read_body, status_error, ElevationService};
use crate::{Error, Result, Service};

#[derive(Serialize)]
struct LookupRequest {
    locations: Vec<Location>,
}

#[derive(Serialize)]
struct Location {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct LookupResponse {
    results: Vec<LookupResult>,
}

#[derive(Deserialize)]
struct LookupResult {
    #[serde(default)]
    elevation: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OpenElevationClient {
    client: Client,
    endpoint: String,
}

impl OpenElevationClient {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout())?,
            endpoint: join_url(&config.elevation_url, "api/v1/lookup"),
        })
    }
}

impl ElevationService for OpenElevationClient {
    async fn lookup(&self, coordinates: &[Coordinate]) -> Result<Vec<Option<f64>>> {
        let request = LookupRequest {
            locations: coordinates
                .iter()
                .map(|c| Location {
                    latitude: c.latitude,
                    longitude: c.longitude,
                })
                .collect(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::transport(Service::Elevation, e))?;
        let (status, body) = read_body(Service::Elevation, response).await?;
        if !status.is_success() {
            return Err(status_error(Service::Elevation, status, &body));
        }

        let parsed: LookupResponse = decode(Service::Elevation, &body)?;
        if parsed.results.len() != coordinates.len() {
            return Err(Error::ServiceRejected {
                service: Service::Elevation,
                message: format!(
                    "{} elevations returned for {} locations",
                    parsed.results.len(),
                    coordinates.len()
                ),
            });
        }

        Ok(parsed
            .results
            .into_iter()
            .map(|r| r.elevation.filter(|e| e.is_finite()))
            .collect())
    }
}
