//! Native file system watcher
//!
//! Most editors forward watcher events themselves via
//! `workspace/didChangeWatchedFiles`, but headless use (and `serve --watch`)
//! needs the engine to observe the disk directly. Events from `notify` are
//! debounced, filtered, turned into on-disk modification batches, and
//! submitted to the pipeline like any client-originated batch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};

use crate::error::{EngineError, Result};
use crate::file::{FileAction, Modification, ModificationSource};
use crate::server::pipeline::ModificationPipeline;
use crate::uri::Uri;

/// Window for collapsing raw notify events into one batch.
const EVENT_WINDOW: Duration = Duration::from_millis(100);

/// Directories never worth watching.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// Watches one root and feeds on-disk batches into the pipeline.
///
/// Dropping the handle stops the watcher thread.
pub struct FileWatcher {
    running: Arc<AtomicBool>,
}

impl FileWatcher {
    /// Start watching `root` recursively. A view rooted there is registered
    /// if none exists, so the resulting batches have somewhere to land.
    pub fn start(root: PathBuf, pipeline: ModificationPipeline) -> Result<FileWatcher> {
        let root_uri = Uri::from_path(&root)?;
        let session = Arc::clone(pipeline.session());
        if session.view_of(&root_uri).is_err() {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root_uri.to_string());
            session.create_view(&name, root_uri)?;
        }
        let extensions = session.options().extensions.clone();

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(EVENT_WINDOW, tx)
            .map_err(|e| EngineError::Transport(format!("creating watcher: {e}")))?;
        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| {
                EngineError::Transport(format!("watching {}: {e}", root.display()))
            })?;
        tracing::info!(root = %root.display(), "watching for file changes");

        // Submissions spawn onto this runtime from the watcher thread.
        let runtime = tokio::runtime::Handle::current();
        std::thread::spawn(move || {
            // Owns the debouncer; dropping it unregisters the OS watches.
            let _debouncer = debouncer;
            while thread_running.load(Ordering::SeqCst) {
                let events = match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(Ok(events)) => events,
                    Ok(Err(e)) => {
                        tracing::warn!("watcher error: {e}");
                        continue;
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                };

                let mut batch = Vec::new();
                for event in events {
                    if event.kind != DebouncedEventKind::Any {
                        continue;
                    }
                    if !watchable(&event.path, &root, &extensions) {
                        continue;
                    }
                    match modification_for(&event.path) {
                        Ok(m) => batch.push(m),
                        Err(e) => tracing::warn!(
                            path = %event.path.display(),
                            "skipping watch event: {e}"
                        ),
                    }
                }
                if batch.is_empty() {
                    continue;
                }

                tracing::debug!(changes = batch.len(), "submitting on-disk batch");
                let _guard = runtime.enter();
                match pipeline.submit(batch, ModificationSource::DidChangeWatchedFiles) {
                    Ok(_latch) => {}
                    Err(e) if e.is_terminal() => break,
                    Err(e) => tracing::error!("submitting watched changes: {e}"),
                }
            }
            tracing::debug!("watcher thread stopped");
        });

        Ok(FileWatcher { running })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Classify one changed path. The debouncer reports paths, not actions, so
/// the action is recovered from the disk state.
fn modification_for(path: &Path) -> Result<Modification> {
    let uri = Uri::from_path(path)?;
    if path.is_dir() {
        // Expanded to contained files by the session.
        return Ok(Modification::on_disk(uri, FileAction::Create));
    }
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let mut m = Modification::on_disk(uri, FileAction::Change);
            m.text = Some(text);
            Ok(m)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(Modification::on_disk(uri, FileAction::Delete))
        }
        Err(e) => Err(EngineError::Io(e)),
    }
}

fn watchable(path: &Path, root: &Path, extensions: &[String]) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    for component in relative.components() {
        let name = component.as_os_str().to_string_lossy();
        if SKIPPED_DIRS.contains(&name.as_ref()) || name.starts_with('.') {
            return false;
        }
    }
    if path.is_dir() || extensions.is_empty() {
        return true;
    }
    path.extension()
        .map(|e| extensions.iter().any(|allowed| e == allowed.as_str()))
        .unwrap_or(false)
}
