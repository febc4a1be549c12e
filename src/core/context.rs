//! Per-run context handed to every stage
//!
//! Carries the run identifier, verbosity, strictness and an optional progress
//! callback. Stages log through it instead of consulting global state, so two
//! runs in the same process can use different levels.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{Level, LevelFilter};

use crate::core::model::Stage;

/// Progress callback: `(stage, completed, total)` in units of batches
pub type ProgressCallback = Arc<dyn Fn(Stage, usize, usize) + Send + Sync>;

#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub level: LevelFilter,
    /// Fail on degraded results instead of recording diagnostics
    pub strict: bool,
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("level", &self.level)
            .field("strict", &self.strict)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new("run")
    }
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            level: LevelFilter::Info,
            strict: false,
            progress: None,
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn emit(&self, level: Level, stage: Stage, message: fmt::Arguments<'_>) {
        if level <= self.level {
            log::log!(level, "[{}] {}: {}", self.run_id, stage, message);
        }
    }

    pub fn debug(&self, stage: Stage, message: impl fmt::Display) {
        self.emit(Level::Debug, stage, format_args!("{message}"));
    }

    pub fn info(&self, stage: Stage, message: impl fmt::Display) {
        self.emit(Level::Info, stage, format_args!("{message}"));
    }

    pub fn warn(&self, stage: Stage, message: impl fmt::Display) {
        self.emit(Level::Warn, stage, format_args!("{message}"));
    }

    /// Report batch progress to the registered callback, if any
    pub fn report_progress(&self, stage: Stage, completed: usize, total: usize) {
        if let Some(progress) = &self.progress {
            progress(stage, completed, total);
        }
    }

    /// Start timing a stage; log the elapsed time with [`RunContext::finish_stage`]
    pub fn start_stage(&self, stage: Stage) -> Instant {
        self.debug(stage, "started");
        Instant::now()
    }

    pub fn finish_stage(&self, stage: Stage, started: Instant, points: usize) {
        self.info(
            stage,
            format_args!("finished {points} points in {:.2?}", started.elapsed()),
        );
    }
}
