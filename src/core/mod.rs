//! Core library modules for trackfuse
//!
//! Track model, the processing stages and their orchestration.

pub mod batch;
pub mod config;
pub mod context;
pub mod elevation;
pub mod filter;
pub mod geo;
pub mod junction;
pub mod matcher;
pub mod metadata;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod segment;
pub mod table;

// Re-export main types for internal use
pub use config::Config;
pub use context::RunContext;
pub use model::{Coordinate, Diagnostic, Route, Stage, TrackPoint, Value};
pub use pipeline::{Pipeline, PipelineOutput};
