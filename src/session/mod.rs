//! Session: owner of all views for one server instance
//!
//! The session resolves which view a URI belongs to and is the sole writer
//! of snapshots. Its lifecycle state check is best-effort cheap; true write
//! exclusivity is guaranteed by the modification pipeline's write lock, not
//! by the check here.

pub mod snapshot;
pub mod view;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::EngineOptions;
use crate::error::{EngineError, Result};
use crate::file::{FileAction, Modification};
use crate::uri::Uri;

pub use snapshot::{MemoCache, Snapshot, SnapshotGuard};
pub use view::View;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Running,
    ShuttingDown,
    ShutDown,
}

/// The snapshots produced by one `did_modify_files` call, with a reference
/// already held on each. Call [`AffectedSnapshots::release`] exactly once
/// when done (typically after diagnosis completes); moving the value into
/// `release` enforces the exactly-once discipline.
#[derive(Debug)]
pub struct AffectedSnapshots {
    guards: Vec<SnapshotGuard>,
}

impl AffectedSnapshots {
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotGuard> {
        self.guards.iter()
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Drop the held references, allowing snapshots with no remaining
    /// holders to be collected.
    pub fn release(self) {}
}

/// Owner of all views; the sole writer of snapshots.
pub struct Session {
    views: RwLock<Vec<Arc<View>>>,
    state: Mutex<SessionState>,
    next_view_id: AtomicU64,
    options: EngineOptions,
}

impl Session {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            views: RwLock::new(Vec::new()),
            state: Mutex::new(SessionState::Running),
            next_view_id: AtomicU64::new(1),
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state() >= SessionState::ShuttingDown
    }

    /// Register a view rooted at `root`. Views are kept in registration
    /// order; `view_of` resolves against the first containing scope.
    pub fn create_view(&self, name: &str, root: Uri) -> Result<Arc<View>> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        let id = self.next_view_id.fetch_add(1, Ordering::SeqCst);
        let view = Arc::new(View::new(id, name.to_string(), root, self.options.clone()));
        tracing::info!(view = id, root = %view.root(), "created view");
        self.views.write().push(Arc::clone(&view));
        Ok(view)
    }

    /// Tear down the view for the given workspace root.
    pub fn remove_view(&self, root: &Uri) {
        let mut views = self.views.write();
        if let Some(pos) = views.iter().position(|v| v.root() == root) {
            let view = views.remove(pos);
            tracing::info!(view = view.id(), root = %root, "removed view");
        }
    }

    pub fn views(&self) -> Vec<Arc<View>> {
        self.views.read().clone()
    }

    /// Resolve the view owning `uri`.
    ///
    /// The session does not infer roots: if no existing scope contains the
    /// URI the caller is expected to register a new view rooted at the
    /// file's containing directory.
    pub fn view_of(&self, uri: &Uri) -> Result<Arc<View>> {
        self.views
            .read()
            .iter()
            .find(|v| v.contains(uri))
            .cloned()
            .ok_or_else(|| EngineError::NoViewFound {
                uri: uri.to_string(),
            })
    }

    /// Replace directory-level modifications with one modification per
    /// contained file, preserving the relative order of the expansion.
    ///
    /// Enumeration order for on-disk walks is platform-dependent; callers
    /// must rely only on whole-batch completion, never on that order. A
    /// deleted directory cannot be enumerated from disk, so deletions expand
    /// against the files the views already know about.
    pub fn expand_modifications_to_directories(&self, mods: Vec<Modification>) -> Vec<Modification> {
        let mut out = Vec::with_capacity(mods.len());
        for m in mods {
            let Ok(path) = m.uri.to_path() else {
                out.push(m);
                continue;
            };
            if m.action == FileAction::Delete {
                let known = self.known_files_under(&m.uri);
                if known.is_empty() {
                    out.push(m);
                } else {
                    for uri in known {
                        out.push(Modification { uri, ..m.clone() });
                    }
                }
            } else if path.is_dir() {
                for uri in files_in_dir(&path) {
                    out.push(Modification { uri, ..m.clone() });
                }
            } else {
                out.push(m);
            }
        }
        out
    }

    /// Files any view's current snapshot knows under `dir` (excluding the
    /// directory URI itself).
    fn known_files_under(&self, dir: &Uri) -> Vec<Uri> {
        let mut found = Vec::new();
        for view in self.views.read().iter() {
            let snap = view.snapshot();
            for uri in snap.uris() {
                if uri != dir && uri.is_within(dir) && !found.contains(uri) {
                    found.push(uri.clone());
                }
            }
        }
        found
    }

    /// Apply a batch of modifications, producing a new snapshot for every
    /// view whose scope intersects the modified URIs.
    ///
    /// Must be called under the pipeline's write lock so that no two batches
    /// interleave; the state check below only produces a fast, clear error
    /// after shutdown.
    pub fn did_modify_files(&self, mods: &[Modification]) -> Result<AffectedSnapshots> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        let views = self.views.read().clone();
        let mut guards = Vec::new();
        for view in views {
            let relevant: Vec<Modification> = mods
                .iter()
                .filter(|m| view.contains(&m.uri))
                .cloned()
                .collect();
            if relevant.is_empty() {
                continue;
            }
            let guard = view.apply(&relevant);
            tracing::debug!(
                view = view.id(),
                generation = guard.generation(),
                changes = relevant.len(),
                "applied modification batch"
            );
            guards.push(guard);
        }
        Ok(AffectedSnapshots { guards })
    }

    /// Enter the draining state: mutations fail fast from here on, but
    /// views stay registered so read-only requests can still be served.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Running {
            *state = SessionState::ShuttingDown;
            tracing::info!("session shutting down");
        }
    }

    /// Transition to the terminal state. All mutation requests fail fast
    /// from this point on; views are dropped once in-flight readers finish.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::ShutDown {
            return;
        }
        *state = SessionState::ShutDown;
        drop(state);
        self.views.write().clear();
        tracing::info!("session shut down");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("views", &self.views.read().len())
            .field("state", &self.state())
            .finish()
    }
}

/// Recursively enumerate regular files under `dir` in filesystem order.
fn files_in_dir(dir: &Path) -> Vec<Uri> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(files_in_dir(&path));
        } else if let Ok(uri) = Uri::from_path(&path) {
            out.push(uri);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn uri(p: &str) -> Uri {
        Uri::from_path(Path::new(p)).unwrap()
    }

    fn change(p: &str, version: i32, text: &str) -> Modification {
        Modification {
            uri: uri(p),
            action: FileAction::Change,
            version,
            text: Some(text.to_string()),
            language_id: None,
            on_disk: false,
        }
    }

    #[test]
    fn test_view_of_resolution() {
        let session = Session::new(EngineOptions::default());
        let v = session.create_view("w", uri("/w")).unwrap();
        assert_eq!(session.view_of(&uri("/w/a.rs")).unwrap().id(), v.id());
        assert!(matches!(
            session.view_of(&uri("/elsewhere/a.rs")),
            Err(EngineError::NoViewFound { .. })
        ));
    }

    #[test]
    fn test_did_modify_files_only_touches_intersecting_views() {
        let session = Session::new(EngineOptions::default());
        let v1 = session.create_view("one", uri("/one")).unwrap();
        let v2 = session.create_view("two", uri("/two")).unwrap();

        let affected = session
            .did_modify_files(&[change("/one/a.rs", 1, "hi")])
            .unwrap();
        assert_eq!(affected.len(), 1);
        affected.release();

        assert_eq!(v1.snapshot().generation(), 1);
        assert_eq!(v2.snapshot().generation(), 0);
    }

    #[test]
    fn test_shutdown_finality() {
        let session = Session::new(EngineOptions::default());
        let v = session.create_view("w", uri("/w")).unwrap();
        let before = v.snapshot().generation();

        session.shutdown();

        let err = session
            .did_modify_files(&[change("/w/a.rs", 1, "hi")])
            .unwrap_err();
        assert!(err.is_terminal());
        // No view's snapshot moved.
        assert_eq!(v.snapshot().generation(), before);

        assert!(matches!(
            session.create_view("x", uri("/x")),
            Err(EngineError::ShutDown)
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let session = Session::new(EngineOptions::default());
        session.shutdown();
        session.shutdown();
        assert_eq!(session.state(), SessionState::ShutDown);
    }

    #[test]
    fn test_expand_directory_deletion_uses_known_files() {
        let session = Session::new(EngineOptions::default());
        session.create_view("w", uri("/w")).unwrap();
        session
            .did_modify_files(&[change("/w/sub/a.rs", 1, "a"), change("/w/sub/b.rs", 1, "b")])
            .unwrap()
            .release();

        let expanded = session.expand_modifications_to_directories(vec![Modification {
            uri: uri("/w/sub"),
            action: FileAction::Delete,
            version: 0,
            text: None,
            language_id: None,
            on_disk: true,
        }]);
        let mut uris: Vec<String> = expanded.iter().map(|m| m.uri.to_string()).collect();
        uris.sort();
        assert_eq!(uris.len(), 2);
        assert!(uris[0].ends_with("a.rs"));
        assert!(uris[1].ends_with("b.rs"));
        assert!(expanded.iter().all(|m| m.action == FileAction::Delete));
    }

    #[test]
    fn test_expand_directory_creation_walks_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("pkg");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.rs"), "a").unwrap();
        std::fs::write(dir.join("nested/b.rs"), "b").unwrap();

        let session = Session::new(EngineOptions::default());
        let expanded = session.expand_modifications_to_directories(vec![Modification {
            uri: Uri::from_path(&dir).unwrap(),
            action: FileAction::Create,
            version: 0,
            text: None,
            language_id: None,
            on_disk: true,
        }]);
        assert_eq!(expanded.len(), 2);
        assert!(expanded.iter().all(|m| m.action == FileAction::Create));
    }
}
