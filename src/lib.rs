//! # Trackfuse Library
//!
//! Enriches GPS tracks with reference data and resamples them onto a fixed
//! distance or time grid.
//!
//! ## Features
//!
//! - **Point filtering**: invalid and stationary points are removed
//! - **Map matching**: positions snapped to the road network (OSRM)
//! - **Metadata**: nearest way and node tags (Overpass), with typed enrichers
//! - **Elevation**: terrain elevation in bulk (Open-Elevation)
//! - **Segmentation**: per-column interpolation onto a uniform grid
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = trackfuse::Config::default();
//!     config.segmentation.distance_m = Some(10.0);
//!
//!     let output = trackfuse::process_file("ride.gpx", config).await?;
//!     let mut stdout = std::io::stdout();
//!     trackfuse::formats::write_table(&output.table()?, &mut stdout)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Custom enrichment
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trackfuse::{ColumnType, EnrichOptions, FnEnricher, Pipeline, RunContext, Value};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = trackfuse::Config::default();
//! config.segmentation.duration_s = Some(5.0);
//!
//! let surface = FnEnricher::new(vec![("paved", ColumnType::Flag)], |tags| {
//!     let paved = tags.get("surface").map(|s| s == "asphalt").unwrap_or(false);
//!     Ok([("paved".to_string(), Value::Bool(paved))].into())
//! });
//! let enrichers = EnrichOptions {
//!     way_enrichment: Some(Arc::new(surface)),
//!     node_enrichment: None,
//! };
//!
//! let route = trackfuse::formats::read_route("ride.csv")?;
//! let pipeline = Pipeline::from_config(config, enrichers)?;
//! let output = pipeline.run(&route, &RunContext::new("ride")).await?;
//! println!("{} samples", output.table()?.len());
//! # Ok(())
//! # }
//! ```

use std::path::Path;

// Re-export core types that users might need
pub use crate::core::config::Config;
pub use crate::core::context::{ProgressCallback, RunContext};
pub use crate::core::metadata::{ColumnEnricher, EnrichOptions, FnEnricher, TagSelector};
pub use crate::core::model::{ColumnType, Coordinate, Diagnostic, Route, Stage, TrackPoint, Value};
pub use crate::core::pipeline::{Pipeline, PipelineOutput};
pub use crate::core::segment::{InterpolationPolicy, SamplingInterval, SegmentationConfig, Segmented};
pub use crate::core::table::{Column, Table};
pub use trackfuse_common::{Error, Result, Service};

pub mod core;
pub mod formats;
pub mod services;

/// Read a track file and run every enabled stage against the configured services
///
/// Enrichment columns come from the tag keys listed in the metadata block.
/// Use [`Pipeline`] directly for custom enrichers or services.
pub async fn process_file(path: impl AsRef<Path>, config: Config) -> Result<PipelineOutput> {
    let path = path.as_ref();
    let route = formats::read_route(path)?;
    let strict = config.network.strict;
    let enrichers = EnrichOptions::from_config(&config.metadata);
    let pipeline = Pipeline::from_config(config, enrichers)?;
    let ctx = RunContext::new(route.id.clone()).with_strict(strict);
    pipeline.run(&route, &ctx).await
}
