//! Common utilities for the trackfuse toolkit

pub mod error;

pub use error::{suggest_column, Error, Result, Service};
