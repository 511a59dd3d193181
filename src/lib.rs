//! langd: incremental workspace-state engine for language tooling
//!
//! The engine maintains an immutable, versioned picture of a workspace's
//! files while an editor streams changes at it. Each batch of modifications
//! produces a new [`session::Snapshot`] at the next generation; readers keep
//! using the snapshot they hold, diagnostics are computed off the request
//! path, and bursty on-disk changes are debounced into single batches.
//!
//! # Layout
//!
//! - [`session`]: views, snapshots, the memo cache, and batch application
//! - [`server`]: JSON-RPC dispatch, the modification pipeline, diagnostics
//! - [`transport`]: wire framing, listeners, and connection forwarding
//! - [`watcher`]: native file watching for headless use
//!
//! # Example
//!
//! ```ignore
//! use langd::config::EngineOptions;
//! use langd::session::Session;
//!
//! let session = Session::new(EngineOptions::default());
//! let view = session.create_view("demo", root_uri)?;
//! session.did_modify_files(&mods)?.release();
//! let snapshot = view.snapshot();
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod file;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod uri;
pub mod watcher;

// Re-export commonly used types
pub use config::EngineOptions;
pub use error::{EngineError, Result};
pub use file::{FileAction, FileHandle, FileKind, Modification, ModificationSource};
pub use session::{MemoCache, Session, Snapshot, SnapshotGuard, View};
pub use uri::Uri;
