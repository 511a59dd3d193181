//! File handles and modification events
//!
//! A [`FileHandle`] is an immutable reference to one file's content and
//! identity at a point in time. A [`Modification`] is a requested state
//! transition for one URI, produced by the protocol handlers and consumed by
//! the modification pipeline.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest as _, Sha256};

use crate::uri::Uri;

/// Version sentinel carried by a close modification.
pub const CLOSE_VERSION: i32 = -1;

/// What a modification does to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Open,
    Change,
    Save,
    Close,
    Create,
    Delete,
    Unknown,
}

/// Why a batch of modifications occurred.
///
/// Carried through for diagnostics-progress labeling only; it never affects
/// how a batch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationSource {
    DidOpen,
    DidChange,
    DidChangeWatchedFiles,
    DidSave,
    DidClose,
    Regeneration,
    InitialWorkspaceLoad,
}

impl fmt::Display for ModificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DidOpen => "opened files",
            Self::DidChange => "changed files",
            Self::DidChangeWatchedFiles => "files changed on disk",
            Self::DidSave => "saved files",
            Self::DidClose => "closed files",
            Self::Regeneration => "regenerated files",
            Self::InitialWorkspaceLoad => "initial workspace load",
        };
        f.write_str(s)
    }
}

/// Closed set of file kinds the engine branches on during invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Ordinary source file.
    Source,
    /// Build/module manifest; a change invalidates all derived state.
    Manifest,
    /// Template file.
    Template,
    /// Workspace-level configuration file.
    Workspace,
    Unknown,
}

impl FileKind {
    /// Classify a URI by its file name.
    pub fn of(uri: &Uri) -> Self {
        let Ok(path) = uri.to_path() else {
            return Self::Unknown;
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match name.as_str() {
            "Cargo.toml" | "go.mod" | "package.json" | "pyproject.toml" => Self::Manifest,
            "Cargo.lock" | "go.work" | "go.sum" => Self::Workspace,
            _ => match path.extension().and_then(|e| e.to_str()) {
                Some("tmpl") | Some("tpl") => Self::Template,
                Some(_) => Self::Source,
                None => Self::Unknown,
            },
        }
    }
}

/// Content digest used for content-addressed memoization.
///
/// Two handles with equal digests have byte-identical content, so derived
/// computations keyed on digests survive no-op saves and unrelated edits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    pub fn short(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.short())
    }
}

/// File content carried by a handle.
#[derive(Debug, Clone)]
pub enum FileContent {
    /// In-memory text, shared between snapshots.
    Text(Arc<str>),
    /// The file exists but its content has not been read.
    Unread,
}

/// Immutable reference to one file's content and identity at a point in time.
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub uri: Uri,
    /// Client-assigned, monotonic per URI; [`CLOSE_VERSION`] after close.
    pub version: i32,
    pub content: FileContent,
    pub action: FileAction,
    pub kind: FileKind,
    /// True if the handle reflects on-disk state rather than an editor overlay.
    pub on_disk: bool,
    digest: Option<ContentDigest>,
}

impl FileHandle {
    pub fn new(uri: Uri, version: i32, text: Option<String>, action: FileAction, on_disk: bool) -> Self {
        let kind = FileKind::of(&uri);
        let (content, digest) = match text {
            Some(t) => {
                let digest = ContentDigest::of(t.as_bytes());
                (FileContent::Text(Arc::from(t.as_str())), Some(digest))
            }
            None => (FileContent::Unread, None),
        };
        Self {
            uri,
            version,
            content,
            action,
            kind,
            on_disk,
            digest,
        }
    }

    /// The text content, if read.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            FileContent::Text(t) => Some(t),
            FileContent::Unread => None,
        }
    }

    /// Content digest, present only for read content.
    pub fn digest(&self) -> Option<ContentDigest> {
        self.digest
    }

    /// True if both handles carry read content with identical bytes.
    pub fn same_content(&self, other: &FileHandle) -> bool {
        matches!((self.digest, other.digest), (Some(a), Some(b)) if a == b)
    }
}

/// A requested state transition for one URI.
#[derive(Debug, Clone)]
pub struct Modification {
    pub uri: Uri,
    pub action: FileAction,
    pub version: i32,
    pub text: Option<String>,
    pub language_id: Option<String>,
    /// True if the modification originated from an on-disk watch event
    /// rather than an editor buffer.
    pub on_disk: bool,
}

impl Modification {
    pub fn on_disk(uri: Uri, action: FileAction) -> Self {
        Self {
            uri,
            action,
            version: 0,
            text: None,
            language_id: None,
            on_disk: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn uri(p: &str) -> Uri {
        Uri::from_path(Path::new(p)).unwrap()
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = FileHandle::new(uri("/w/a.rs"), 1, Some("fn main() {}".into()), FileAction::Open, false);
        let b = FileHandle::new(uri("/w/b.rs"), 7, Some("fn main() {}".into()), FileAction::Change, false);
        let c = FileHandle::new(uri("/w/a.rs"), 2, Some("fn main() { }".into()), FileAction::Change, false);
        assert!(a.same_content(&b));
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_unread_has_no_digest() {
        let h = FileHandle::new(uri("/w/a.rs"), 0, None, FileAction::Create, true);
        assert!(h.digest().is_none());
        assert!(h.text().is_none());
    }

    #[test]
    fn test_file_kind_classification() {
        assert_eq!(FileKind::of(&uri("/w/src/lib.rs")), FileKind::Source);
        assert_eq!(FileKind::of(&uri("/w/Cargo.toml")), FileKind::Manifest);
        assert_eq!(FileKind::of(&uri("/w/go.work")), FileKind::Workspace);
        assert_eq!(FileKind::of(&uri("/w/page.tmpl")), FileKind::Template);
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(
            ModificationSource::DidChangeWatchedFiles.to_string(),
            "files changed on disk"
        );
        assert_eq!(ModificationSource::DidOpen.to_string(), "opened files");
    }
}
