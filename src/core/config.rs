//! Run configuration
//!
//! Loaded from TOML, overridden by environment variables for the service
//! endpoints, then by CLI flags. Every block has working defaults so an
//! empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::segment::{InterpolationPolicy, SamplingInterval, SegmentationConfig, DEFAULT_MAX_SAMPLES};
use crate::{Error, Result};

/// Map matching requests are limited by the service's URL length; stay well below
pub const MATCHING_LOCATION_LIMIT: usize = 20_000;

/// Open-Elevation rejects POST bodies with more locations than this
pub const ELEVATION_LOCATION_LIMIT: usize = 2_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub services: ServicesConfig,
    pub filter: FilterOptions,
    pub matching: MatchOptions,
    pub elevation: ElevationOptions,
    pub metadata: MetadataOptions,
    pub network: NetworkOptions,
    pub segmentation: SegmentationOptions,
    pub stages: StageToggles,
}

/// External service endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub matching_url: String,
    pub elevation_url: String,
    pub geodata_url: String,
    /// OSRM routing profile used in match requests
    pub matching_profile: String,
    pub request_timeout_secs: f64,
}

impl ServicesConfig {
    /// Per-request timeout, falling back to the default for out-of-range values
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.request_timeout_secs).unwrap_or(Duration::from_secs(30))
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            matching_url: "http://localhost:5000".to_string(),
            elevation_url: "http://localhost:8080".to_string(),
            geodata_url: "http://localhost:12345".to_string(),
            matching_profile: "driving".to_string(),
            request_timeout_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterOptions {
    /// Speeds below this (m/s) count as stationary
    pub speed_epsilon: f64,
    /// Points closer than this (m) to the last kept point are dropped
    pub distance_tolerance_m: f64,
    /// Keep points at exactly (0, 0)
    pub allow_null_island: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            speed_epsilon: 0.1,
            distance_tolerance_m: 1.0,
            allow_null_island: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    pub batch_size: usize,
    /// Matchings below this confidence are reported
    pub min_confidence: f64,
    /// Keep the raw position in `original_latitude` / `original_longitude`
    pub keep_original_position: bool,
    /// Length (m) of the window used to smooth routed speeds
    pub speed_window_m: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            min_confidence: 0.8,
            keep_original_position: false,
            speed_window_m: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationOptions {
    pub batch_size: usize,
}

impl Default for ElevationOptions {
    fn default() -> Self {
        Self {
            batch_size: ELEVATION_LOCATION_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataOptions {
    /// A way further than this from a point is not attached
    pub max_way_distance_m: f64,
    /// A node further than this from a point is not attached
    pub max_node_distance_m: f64,
    /// Way tag keys copied into `way_<key>` columns
    pub way_columns: Vec<String>,
    /// Node tag keys copied into `node_<key>` columns
    pub node_columns: Vec<String>,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            max_way_distance_m: 25.0,
            max_node_distance_m: 5.0,
            way_columns: Vec::new(),
            node_columns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Concurrent requests per service
    pub parallelism: usize,
    /// Fail the run instead of degrading points
    pub strict: bool,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            parallelism: num_cpus::get().clamp(2, 8),
            strict: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationOptions {
    pub distance_m: Option<f64>,
    pub duration_s: Option<f64>,
    /// Column name -> interpolation policy overrides
    pub columns: BTreeMap<String, InterpolationPolicy>,
    /// Axis distance within which a sample coincides with an event point
    pub impulse_tolerance: f64,
    /// Upper bound on output rows per route
    pub max_samples: usize,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            distance_m: None,
            duration_s: None,
            columns: BTreeMap::new(),
            impulse_tolerance: 1e-6,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageToggles {
    pub matching: bool,
    pub metadata: bool,
    pub elevation: bool,
    pub segmentation: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            matching: true,
            metadata: true,
            elevation: true,
            segmentation: true,
        }
    }
}

impl Config {
    /// Read a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Apply `OSRM_API_URL`, `OPEN_ELEVATION_API_URL`, `OVERPASS_API_URL`
    /// and `REQUEST_TIMEOUT` from the environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("OSRM_API_URL") {
            self.services.matching_url = url;
        }
        if let Some(url) = lookup("OPEN_ELEVATION_API_URL") {
            self.services.elevation_url = url;
        }
        if let Some(url) = lookup("OVERPASS_API_URL") {
            self.services.geodata_url = url;
        }
        if let Some(timeout) = lookup("REQUEST_TIMEOUT") {
            self.services.request_timeout_secs = timeout.trim().parse().map_err(|_| {
                Error::Configuration(format!("REQUEST_TIMEOUT must be a number of seconds, got '{timeout}'"))
            })?;
        }
        Ok(self)
    }

    /// Check value ranges; run before any work starts
    pub fn validate(&self) -> Result<()> {
        let timeout = self.services.request_timeout_secs;
        if timeout.is_nan() || timeout <= 0.0 || Duration::try_from_secs_f64(timeout).is_err() {
            return Err(Error::Configuration(format!(
                "request timeout must be a positive number of seconds, got {timeout}"
            )));
        }
        if self.matching.batch_size < 2 || self.matching.batch_size > MATCHING_LOCATION_LIMIT {
            return Err(Error::Configuration(format!(
                "matching batch size must be between 2 and {MATCHING_LOCATION_LIMIT}, got {}",
                self.matching.batch_size
            )));
        }
        if self.elevation.batch_size == 0 || self.elevation.batch_size > ELEVATION_LOCATION_LIMIT {
            return Err(Error::Configuration(format!(
                "elevation batch size must be between 1 and {ELEVATION_LOCATION_LIMIT}, got {}",
                self.elevation.batch_size
            )));
        }
        if !(0.0..=1.0).contains(&self.matching.min_confidence) {
            return Err(Error::Configuration(format!(
                "min_confidence must be within [0, 1], got {}",
                self.matching.min_confidence
            )));
        }
        let window = self.matching.speed_window_m;
        if !window.is_finite() || window <= 0.0 {
            return Err(Error::Configuration(format!(
                "speed window must be a positive number of metres, got {window}"
            )));
        }
        if self.network.parallelism == 0 {
            return Err(Error::Configuration("parallelism must be at least 1".to_string()));
        }
        if self.filter.distance_tolerance_m < 0.0 || self.filter.speed_epsilon < 0.0 {
            return Err(Error::Configuration(
                "filter tolerances must not be negative".to_string(),
            ));
        }
        if self.stages.segmentation {
            self.segmentation_config()?;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.network.max_retries,
            base_delay: Duration::from_millis(self.network.base_delay_ms),
            timeout: self.request_timeout(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.services.timeout()
    }

    /// Typed segmentation settings; fails on conflicting or missing interval
    pub fn segmentation_config(&self) -> Result<SegmentationConfig> {
        let options = &self.segmentation;
        let interval = match (options.distance_m, options.duration_s) {
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "segmentation distance and duration are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Configuration(
                    "segmentation needs either a distance or a duration interval".to_string(),
                ))
            }
            (Some(metres), None) => SamplingInterval::Distance(metres),
            (None, Some(seconds)) => SamplingInterval::Duration(seconds),
        };
        SegmentationConfig::new(interval)
            .map(|config| {
                config
                    .with_policies(options.columns.clone())
                    .with_impulse_tolerance(options.impulse_tolerance)
                    .with_max_samples(options.max_samples)
            })
    }
}
