//! Workspace views
//!
//! A [`View`] is one workspace root's configuration scope. It owns the
//! current snapshot and coordinates its replacement; readers acquire the
//! current snapshot through a guard and never contend with the write path
//! beyond the pointer swap.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineOptions;
use crate::file::Modification;
use crate::uri::Uri;

use super::snapshot::{Snapshot, SnapshotGuard};

/// One workspace root's scope, owning the current [`Snapshot`].
pub struct View {
    id: u64,
    name: String,
    root: Uri,
    options: EngineOptions,

    /// Pointer to the current snapshot. Swapped only by the session's write
    /// path; readers clone the Arc out and operate off the immutable value.
    current: Mutex<Arc<Snapshot>>,
}

impl View {
    pub(crate) fn new(id: u64, name: String, root: Uri, options: EngineOptions) -> Self {
        Self {
            id,
            name,
            root,
            options,
            current: Mutex::new(Arc::new(Snapshot::initial(id))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Uri {
        &self.root
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// True if the URI falls inside this view's root.
    pub fn contains(&self, uri: &Uri) -> bool {
        uri.is_within(&self.root)
    }

    /// Acquire the current snapshot. The returned guard keeps it alive; the
    /// read path never takes the session write lock.
    pub fn snapshot(&self) -> SnapshotGuard {
        SnapshotGuard::acquire(Arc::clone(&self.current.lock()))
    }

    /// Apply a batch to the current snapshot and install the successor.
    ///
    /// Callers must hold the session write lock; the mutex here only protects
    /// the pointer swap against concurrent readers.
    pub(crate) fn apply(&self, mods: &[Modification]) -> SnapshotGuard {
        let mut current = self.current.lock();
        let next = Arc::new(Snapshot::apply(&current, mods));
        *current = Arc::clone(&next);
        SnapshotGuard::acquire(next)
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("root", &self.root.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileAction;
    use std::path::Path;

    fn view() -> View {
        View::new(
            1,
            "w".to_string(),
            Uri::from_path(Path::new("/w")).unwrap(),
            EngineOptions::default(),
        )
    }

    fn change(p: &str, text: &str) -> Modification {
        Modification {
            uri: Uri::from_path(Path::new(p)).unwrap(),
            action: FileAction::Change,
            version: 1,
            text: Some(text.to_string()),
            language_id: None,
            on_disk: false,
        }
    }

    #[test]
    fn test_scope_containment() {
        let v = view();
        assert!(v.contains(&Uri::from_path(Path::new("/w/src/a.rs")).unwrap()));
        assert!(!v.contains(&Uri::from_path(Path::new("/x/a.rs")).unwrap()));
    }

    #[test]
    fn test_apply_swaps_current_but_old_guard_survives() {
        let v = view();
        let old = v.snapshot();
        assert_eq!(old.generation(), 0);

        let new = v.apply(&[change("/w/a.rs", "hi")]);
        assert_eq!(new.generation(), 1);

        // The old guard still reads the old, empty state.
        assert_eq!(old.file_count(), 0);
        assert_eq!(v.snapshot().generation(), 1);
    }
}
