//! Engine configuration knobs

use std::time::Duration;

/// Options controlling the workspace-state engine.
///
/// These are the knobs that matter to the core: how long to debounce on-disk
/// change batches, and whether to emit work-done progress notifications
/// around each diagnosed batch.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Delay before applying a batch of on-disk (watched-file) changes.
    ///
    /// Zero disables debouncing: on-disk batches are applied immediately,
    /// the same as editor-originated batches.
    pub watched_file_delay: Duration,

    /// Emit "diagnosing ..." / "Done." progress notifications around each
    /// modification batch.
    pub verbose_progress: bool,

    /// File extensions considered source files by the native watcher.
    /// Empty means all files are accepted.
    pub extensions: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            watched_file_delay: Duration::ZERO,
            verbose_progress: false,
            extensions: vec![],
        }
    }
}

impl EngineOptions {
    /// Options with a nonzero on-disk debounce window.
    pub fn with_watched_file_delay(delay: Duration) -> Self {
        Self {
            watched_file_delay: delay,
            ..Self::default()
        }
    }
}
