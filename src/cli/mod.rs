//! CLI-specific utilities for trackfuse
//!
//! Code used only by the command-line interface, kept apart from the
//! library.

pub mod progress;

pub use progress::ProgressManager;
