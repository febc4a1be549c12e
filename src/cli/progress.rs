//! CLI-specific progress handling for trackfuse
//!
//! One progress bar per batched stage, fed by the run context's progress
//! callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use trackfuse::{ProgressCallback, Stage};

/// Creates a progress bar counting the batches of one stage
pub fn create_progress_bar(total: u64, stage: Stage) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:>12} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} batches")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_prefix(stage.to_string());
    pb
}

/// Progress bars for a pipeline run
#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<Stage, ProgressBar>>>,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// Progress manager that draws nothing, for quiet runs
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record progress of `stage`, creating its bar on first use
    pub fn update(&self, stage: Stage, completed: usize, total: usize) {
        let Ok(mut bars) = self.bars.lock() else { return };
        let pb = bars
            .entry(stage)
            .or_insert_with(|| self.multi.add(create_progress_bar(total as u64, stage)));
        if pb.length() != Some(total as u64) {
            pb.set_length(total as u64);
        }
        pb.set_position(completed as u64);
        if completed >= total {
            pb.finish();
        }
    }

    /// Callback to install on the run context
    pub fn callback(&self) -> ProgressCallback {
        let manager = self.clone();
        Arc::new(move |stage, completed, total| manager.update(stage, completed, total))
    }

    /// Position of a stage's bar, if the stage reported progress
    pub fn position(&self, stage: Stage) -> Option<u64> {
        self.bars.lock().ok()?.get(&stage).map(ProgressBar::position)
    }

    /// Clear any bar still drawn
    pub fn finish(&self) {
        if let Ok(bars) = self.bars.lock() {
            for pb in bars.values().filter(|pb| !pb.is_finished()) {
                pb.abandon();
            }
        }
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_progress_bar_template() {
        let pb = create_progress_bar(10, Stage::Match);
        assert_eq!(pb.length().unwrap(), 10);
        assert_eq!(pb.prefix(), Stage::Match.to_string());
        pb.set_position(3);
        pb.finish();
    }

    #[test]
    fn test_callback_drives_stage_bars() {
        let manager = ProgressManager::hidden();
        let callback = manager.callback();
        callback(Stage::Elevation, 1, 4);
        callback(Stage::Match, 2, 2);
        callback(Stage::Elevation, 3, 4);

        assert_eq!(manager.position(Stage::Elevation), Some(3));
        assert_eq!(manager.position(Stage::Match), Some(2));
        assert_eq!(manager.position(Stage::Metadata), None);
        manager.finish();
    }
}
