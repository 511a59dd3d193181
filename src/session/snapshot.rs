//! Immutable workspace snapshots
//!
//! A [`Snapshot`] is an immutable, versioned view of the whole workspace's
//! file set plus memoized derived state. Applying a batch of modifications to
//! a snapshot produces a new snapshot at the next generation; the prior one
//! stays valid for as long as any holder retains a [`SnapshotGuard`].
//!
//! # Memoization
//!
//! Derived computations are content-addressed: cache keys include the SHA-256
//! digests of every input file, so a no-op save (identical bytes) invalidates
//! nothing and unrelated files' cached results survive unrelated edits. On
//! top of that, applying a batch evicts entries that depended on a file whose
//! bytes actually changed, file by file. A manifest-kind change flushes the
//! whole cache.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::file::{FileAction, FileHandle, FileKind, Modification, CLOSE_VERSION};
use crate::uri::Uri;

/// Cache key for one derived computation: the computation's name plus the
/// digests of its input files, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    kind: &'static str,
    digests: Vec<crate::file::ContentDigest>,
}

struct MemoEntry {
    value: Arc<dyn Any + Send + Sync>,
    /// URIs this entry was derived from, for file-by-file eviction.
    deps: Vec<Uri>,
}

/// Content-addressed memo store shared by all snapshots of one view.
///
/// Sharing is safe because keys embed content digests: a reader of an old
/// snapshot can at worst miss and recompute an identical value.
#[derive(Default)]
pub struct MemoCache {
    entries: RwLock<HashMap<MemoKey, MemoEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoCache {
    /// Evict every entry that depended on `uri`.
    fn invalidate_file(&self, uri: &Uri) {
        self.entries.write().retain(|_, e| !e.deps.contains(uri));
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    /// (hits, misses) since creation. Exposed for tests and status queries.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Immutable, versioned view of the workspace file set.
pub struct Snapshot {
    /// Id of the owning view. Generations from different views are
    /// incomparable; consumers that order snapshots must scope by this.
    view_id: u64,
    /// Strictly increasing per view.
    generation: u64,
    files: HashMap<Uri, Arc<FileHandle>>,
    memo: Arc<MemoCache>,
    holders: AtomicUsize,
}

impl Snapshot {
    /// The empty snapshot a fresh view starts from.
    pub fn initial(view_id: u64) -> Self {
        Self {
            view_id,
            generation: 0,
            files: HashMap::new(),
            memo: Arc::new(MemoCache::default()),
            holders: AtomicUsize::new(0),
        }
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Look up the handle for a URI.
    pub fn file(&self, uri: &Uri) -> Option<&Arc<FileHandle>> {
        self.files.get(uri)
    }

    /// All URIs known to this snapshot.
    pub fn uris(&self) -> impl Iterator<Item = &Uri> {
        self.files.keys()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn memo(&self) -> &Arc<MemoCache> {
        &self.memo
    }

    /// Holders currently keeping this snapshot alive.
    pub fn active_holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    /// Fetch or compute a derived value for the given input files.
    ///
    /// Returns `None` if any input is missing or unread, in which case the
    /// computation cannot be content-addressed and the caller should compute
    /// uncached.
    pub fn memoized<T, F>(&self, kind: &'static str, inputs: &[Uri], compute: F) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&Snapshot) -> T,
    {
        let mut digests = Vec::with_capacity(inputs.len());
        for uri in inputs {
            digests.push(self.files.get(uri)?.digest()?);
        }
        let key = MemoKey { kind, digests };

        if let Some(entry) = self.memo.entries.read().get(&key) {
            if let Ok(value) = Arc::clone(&entry.value).downcast::<T>() {
                self.memo.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        self.memo.misses.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(compute(self));
        self.memo.entries.write().insert(
            key,
            MemoEntry {
                value: Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
                deps: inputs.to_vec(),
            },
        );
        Some(value)
    }

    /// Produce the successor snapshot by applying `mods` in order.
    ///
    /// The prior snapshot is untouched; every update builds a new file map.
    /// Memo entries derived from files whose bytes actually changed are
    /// evicted; a byte-identical replacement (no-op save) evicts nothing.
    pub fn apply(prior: &Snapshot, mods: &[Modification]) -> Snapshot {
        let mut files = prior.files.clone();

        for m in mods {
            match m.action {
                FileAction::Delete => {
                    files.remove(&m.uri);
                }
                FileAction::Close => {
                    // The overlay is gone; the file reverts to on-disk state.
                    files.insert(
                        m.uri.clone(),
                        Arc::new(FileHandle::new(
                            m.uri.clone(),
                            CLOSE_VERSION,
                            None,
                            FileAction::Close,
                            true,
                        )),
                    );
                }
                _ => {
                    // A save without text keeps the buffered content.
                    let text = match (&m.text, files.get(&m.uri)) {
                        (Some(t), _) => Some(t.clone()),
                        (None, Some(prev)) if m.action == FileAction::Save => {
                            prev.text().map(str::to_string)
                        }
                        (None, _) => None,
                    };
                    files.insert(
                        m.uri.clone(),
                        Arc::new(FileHandle::new(
                            m.uri.clone(),
                            m.version,
                            text,
                            m.action,
                            m.on_disk,
                        )),
                    );
                }
            }
        }

        let mut manifest_changed = false;
        for m in mods {
            if !content_changed(prior.files.get(&m.uri), files.get(&m.uri)) {
                continue;
            }
            prior.memo.invalidate_file(&m.uri);
            if FileKind::of(&m.uri) == FileKind::Manifest {
                manifest_changed = true;
            }
        }
        if manifest_changed {
            prior.memo.clear();
        }

        Snapshot {
            view_id: prior.view_id,
            generation: prior.generation + 1,
            files,
            memo: Arc::clone(&prior.memo),
            holders: AtomicUsize::new(0),
        }
    }
}

/// Compare handles by content digest; a missing handle or an unread content
/// always counts as changed.
fn content_changed(old: Option<&Arc<FileHandle>>, new: Option<&Arc<FileHandle>>) -> bool {
    match (old, new) {
        (Some(a), Some(b)) => !a.same_content(b),
        (None, None) => false,
        _ => true,
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("generation", &self.generation)
            .field("files", &self.files.len())
            .field("holders", &self.active_holders())
            .finish()
    }
}

/// Acquired reference to a snapshot.
///
/// Construction increments the snapshot's holder count, drop decrements it.
/// The snapshot's memory lives for as long as any guard (or its view) holds
/// the inner `Arc`; the explicit count exists so callers and tests can
/// observe liveness.
#[derive(Debug)]
pub struct SnapshotGuard {
    inner: Arc<Snapshot>,
}

impl SnapshotGuard {
    pub(crate) fn acquire(inner: Arc<Snapshot>) -> Self {
        inner.holders.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Clone for SnapshotGuard {
    fn clone(&self) -> Self {
        Self::acquire(Arc::clone(&self.inner))
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.inner.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::ops::Deref for SnapshotGuard {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.inner
    }
}
