//! Overpass API client: highway ways and tagged nodes inside a bounding box

use reqwest::Client;
use serde::Deserialize;

use crate::core::config::ServicesConfig;
use crate::core::geo::BoundingBox;
use crate::core::model::{Coordinate, TagMap};
use crate::services::{decode, http_client, join_url, read_body, status_error, GeodataExtract, GeodataService, Node, Way};
use crate::{Error, Result, Service};

#[derive(Deserialize)]
struct OverpassResponse {
    elements: Vec<Element>,
}

#[derive(Deserialize)]
struct LatLon {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Element {
    Node {
        id: i64,
        lat: f64,
        lon: f64,
        #[serde(default)]
        tags: TagMap,
    },
    Way {
        id: i64,
        #[serde(default)]
        nodes: Vec<i64>,
        #[serde(default)]
        geometry: Vec<Option<LatLon>>,
        #[serde(default)]
        tags: TagMap,
    },
    #[serde(other)]
    Other,
}

/// Overpass QL for all highway ways and tagged nodes in `bbox`
fn build_query(bbox: &BoundingBox, timeout_secs: u64) -> String {
    let area = format!(
        "{:.7},{:.7},{:.7},{:.7}",
        bbox.south, bbox.west, bbox.north, bbox.east
    );
    format!(
        "[out:json][timeout:{timeout_secs}];\n(\n  way[\"highway\"]({area});\n  node({area})(if:count_tags() > 0);\n);\nout body geom;"
    )
}

#[derive(Debug, Clone)]
pub struct OverpassClient {
    client: Client,
    endpoint: String,
    timeout_secs: u64,
}

impl OverpassClient {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        let timeout = config.timeout();
        Ok(Self {
            client: http_client(timeout)?,
            endpoint: join_url(&config.geodata_url, "api/interpreter"),
            timeout_secs: timeout.as_secs().max(1),
        })
    }
}

impl GeodataService for OverpassClient {
    async fn query_bbox(&self, bbox: BoundingBox) -> Result<GeodataExtract> {
        let query = build_query(&bbox, self.timeout_secs);
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|e| Error::transport(Service::Geodata, e))?;
        let (status, body) = read_body(Service::Geodata, response).await?;
        if !status.is_success() {
            return Err(status_error(Service::Geodata, status, &body));
        }

        let parsed: OverpassResponse = decode(Service::Geodata, &body)?;
        let mut extract = GeodataExtract::default();
        for element in parsed.elements {
            match element {
                Element::Node { id, lat, lon, tags } => extract.nodes.push(Node {
                    id,
                    position: Coordinate::new(lat, lon),
                    tags,
                }),
                Element::Way {
                    id,
                    nodes,
                    geometry,
                    tags,
                } => {
                    // Node ids only line up with the geometry when no vertex was clipped
                    let nodes = if nodes.len() == geometry.len() && geometry.iter().all(Option::is_some) {
                        nodes
                    } else {
                        Vec::new()
                    };
                    let geometry: Vec<Coordinate> = geometry
                        .into_iter()
                        .flatten()
                        .map(|p| Coordinate::new(p.lat, p.lon))
                        .collect();
                    if !geometry.is_empty() {
                        extract.ways.push(Way {
                            id,
                            geometry,
                            nodes,
                            tags,
                        });
                    }
                }
                Element::Other => {}
            }
        }
        Ok(extract)
    }
}
