//! Asynchronous diagnostics scheduling
//!
//! For each new snapshot the scheduler computes diagnostics on a detached
//! task and publishes them through the [`Client`] callback. The task is
//! deliberately not tied to the triggering request: the client should still
//! receive diagnostics even though a didChange notification awaits no reply.
//!
//! Overlapping schedules may run concurrently against different snapshots.
//! A per-(view, URI) generation watermark guarantees that results computed
//! for an old snapshot are discarded rather than overwriting a newer
//! snapshot's results for the same file. The watermark lock is held across
//! each publication so the check and the publish cannot interleave between
//! tasks; [`Client`] implementations are required not to block.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::protocol::{Diagnostic, Position, PublishDiagnosticsParams, Range};
use crate::session::{AffectedSnapshots, Snapshot};
use crate::uri::Uri;

use super::latch::Latch;
use super::Client;

/// The seam for analysis passes. The engine treats diagnosis as an opaque,
/// re-runnable computation over one immutable snapshot.
pub trait Diagnoser: Send + Sync + 'static {
    fn diagnose(&self, snapshot: &Snapshot) -> Result<Vec<(Uri, Vec<Diagnostic>)>>;
}

/// Flags unresolved merge-conflict markers in open files. This is the
/// language-independent check the binary ships with; richer analyzers plug
/// in through [`Diagnoser`].
pub struct ConflictMarkerDiagnoser;

impl Diagnoser for ConflictMarkerDiagnoser {
    fn diagnose(&self, snapshot: &Snapshot) -> Result<Vec<(Uri, Vec<Diagnostic>)>> {
        let mut out = Vec::new();
        for uri in snapshot.uris() {
            let Some(handle) = snapshot.file(uri) else {
                continue;
            };
            let Some(text) = handle.text() else {
                continue;
            };
            let mut diags = Vec::new();
            for (i, line) in text.lines().enumerate() {
                if line.starts_with("<<<<<<< ") || line.starts_with(">>>>>>> ") {
                    diags.push(Diagnostic {
                        range: Range {
                            start: Position { line: i as u32, character: 0 },
                            end: Position {
                                line: i as u32,
                                character: line.chars().map(char::len_utf16).sum::<usize>() as u32,
                            },
                        },
                        severity: Some(1),
                        source: Some("langd".to_string()),
                        message: "unresolved merge conflict marker".to_string(),
                    });
                }
            }
            // Publish for every file, including an empty set, so stale
            // diagnostics get cleared.
            out.push((uri.clone(), diags));
        }
        Ok(out)
    }
}

/// Schedules diagnosis of new snapshots off the request path.
///
/// Cloning is cheap; clones share the publication watermarks.
#[derive(Clone)]
pub struct DiagnosticScheduler {
    client: Arc<dyn Client>,
    diagnoser: Arc<dyn Diagnoser>,
    /// Highest generation already published per (view, URI). Generations
    /// are only comparable within one view, so nested views diagnosing the
    /// same file never discard each other's results.
    published: Arc<Mutex<HashMap<(u64, Uri), u64>>>,
}

impl DiagnosticScheduler {
    pub fn new(client: Arc<dyn Client>, diagnoser: Arc<dyn Diagnoser>) -> Self {
        Self {
            client,
            diagnoser,
            published: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Launch diagnosis of the given snapshots without blocking the caller.
    ///
    /// The returned latch opens once diagnostics for every snapshot have
    /// been published (or discarded) and the snapshot references released.
    pub fn schedule(&self, snapshots: AffectedSnapshots, on_disk: bool) -> Latch {
        let latch = Latch::new();
        let done = latch.clone();
        let this = self.clone();
        tokio::spawn(async move {
            for guard in snapshots.iter() {
                this.diagnose_snapshot(guard, on_disk);
            }
            snapshots.release();
            done.open();
        });
        latch
    }

    /// Forget a deleted file: drop its watermarks and clear any diagnostics
    /// still displayed for it.
    pub(crate) fn forget(&self, uri: &Uri) {
        let mut published = self.published.lock();
        let before = published.len();
        published.retain(|(_, u), _| u != uri);
        if published.len() != before {
            self.client.publish_diagnostics(PublishDiagnosticsParams {
                uri: uri.clone(),
                diagnostics: Vec::new(),
            });
        }
    }

    fn diagnose_snapshot(&self, snapshot: &Snapshot, on_disk: bool) {
        let view = snapshot.view_id();
        let generation = snapshot.generation();
        let results = match self.diagnoser.diagnose(snapshot) {
            Ok(results) => results,
            Err(e) => {
                // A diagnosis failure never fails the edit that triggered it.
                tracing::error!(generation, on_disk, "diagnosing snapshot: {e}");
                return;
            }
        };

        for (uri, diagnostics) in results {
            // The lock stays held through the publish: once a newer
            // generation has published for this URI, an older task can no
            // longer slip its results in afterwards.
            let mut published = self.published.lock();
            let key = (view, uri.clone());
            if let Some(&newer) = published.get(&key) {
                if newer > generation {
                    tracing::debug!(
                        %uri,
                        generation,
                        newer,
                        "discarding stale diagnostics"
                    );
                    continue;
                }
            }
            published.insert(key, generation);
            self.client
                .publish_diagnostics(PublishDiagnosticsParams { uri, diagnostics });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::file::{FileAction, Modification};
    use crate::server::testing::RecordingClient;
    use crate::session::Session;
    use std::path::Path;

    struct EverythingIsBroken;

    impl Diagnoser for EverythingIsBroken {
        fn diagnose(&self, snapshot: &Snapshot) -> Result<Vec<(Uri, Vec<Diagnostic>)>> {
            Ok(snapshot
                .uris()
                .map(|u| {
                    (
                        u.clone(),
                        vec![Diagnostic {
                            range: Range {
                                start: Position { line: 0, character: 0 },
                                end: Position { line: 0, character: 1 },
                            },
                            severity: Some(1),
                            source: None,
                            message: format!("generation {}", snapshot.generation()),
                        }],
                    )
                })
                .collect())
        }
    }

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

    #[tokio::test]
    async fn test_schedule_publishes_and_opens_latch() {
        let client = Arc::new(RecordingClient::default());
        let scheduler = DiagnosticScheduler::new(
            Arc::clone(&client) as Arc<dyn Client>,
            Arc::new(EverythingIsBroken),
        );

        let session = Session::new(EngineOptions::default());
        session.create_view("w", uri("/w")).unwrap();
        let affected = session.did_modify_files(&[change("/w/a.rs", 1, "x")]).unwrap();

        let latch = scheduler.schedule(affected, false);
        latch.wait().await;

        let published = client.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].diagnostics[0].message, "generation 1");
    }

    #[tokio::test]
    async fn test_stale_generation_discarded() {
        let client = Arc::new(RecordingClient::default());
        let scheduler = DiagnosticScheduler::new(
            Arc::clone(&client) as Arc<dyn Client>,
            Arc::new(EverythingIsBroken),
        );

        let session = Session::new(EngineOptions::default());
        session.create_view("w", uri("/w")).unwrap();
        let old = session.did_modify_files(&[change("/w/a.rs", 1, "one")]).unwrap();
        let new = session.did_modify_files(&[change("/w/a.rs", 2, "two")]).unwrap();

        // Newer snapshot's diagnosis lands first; the older one must be
        // discarded rather than overwrite it.
        scheduler.schedule(new, false).wait().await;
        scheduler.schedule(old, false).wait().await;

        let published = client.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].diagnostics[0].message, "generation 2");
    }

    #[tokio::test]
    async fn test_diagnoser_error_is_swallowed() {
        struct Failing;
        impl Diagnoser for Failing {
            fn diagnose(&self, _: &Snapshot) -> Result<Vec<(Uri, Vec<Diagnostic>)>> {
                Err(crate::error::EngineError::invalid_edit("boom"))
            }
        }

        let client = Arc::new(RecordingClient::default());
        let scheduler = DiagnosticScheduler::new(
            Arc::clone(&client) as Arc<dyn Client>,
            Arc::new(Failing),
        );
        let session = Session::new(EngineOptions::default());
        session.create_view("w", uri("/w")).unwrap();
        let affected = session.did_modify_files(&[change("/w/a.rs", 1, "x")]).unwrap();

        // The latch still opens; nothing is published.
        scheduler.schedule(affected, false).wait().await;
        assert!(client.published.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_racing_schedules_never_publish_backwards() {
        let client = Arc::new(RecordingClient::default());
        let scheduler = DiagnosticScheduler::new(
            Arc::clone(&client) as Arc<dyn Client>,
            Arc::new(EverythingIsBroken),
        );

        let session = Session::new(EngineOptions::default());
        session.create_view("w", uri("/w")).unwrap();

        // Create all the generations first, then let their diagnosis tasks
        // race on worker threads.
        let mut batches = Vec::new();
        for v in 1..=16 {
            batches.push(
                session
                    .did_modify_files(&[change("/w/a.rs", v, &format!("v{v}"))])
                    .unwrap(),
            );
        }
        let latches: Vec<_> = batches
            .into_iter()
            .map(|batch| scheduler.schedule(batch, false))
            .collect();
        for latch in latches {
            latch.wait().await;
        }

        let published = client.published.lock();
        assert!(!published.is_empty());
        let generations: Vec<u64> = published
            .iter()
            .map(|p| {
                p.diagnostics[0]
                    .message
                    .strip_prefix("generation ")
                    .unwrap()
                    .parse()
                    .unwrap()
            })
            .collect();
        assert!(
            generations.windows(2).all(|w| w[0] <= w[1]),
            "published out of order: {generations:?}"
        );
    }

    #[tokio::test]
    async fn test_forget_prunes_watermark_and_clears_diagnostics() {
        let client = Arc::new(RecordingClient::default());
        let scheduler = DiagnosticScheduler::new(
            Arc::clone(&client) as Arc<dyn Client>,
            Arc::new(EverythingIsBroken),
        );

        let session = Session::new(EngineOptions::default());
        session.create_view("w", uri("/w")).unwrap();
        let affected = session.did_modify_files(&[change("/w/a.rs", 1, "x")]).unwrap();
        scheduler.schedule(affected, false).wait().await;
        assert_eq!(scheduler.published.lock().len(), 1);

        scheduler.forget(&uri("/w/a.rs"));
        assert!(scheduler.published.lock().is_empty());
        // The client's stale diagnostics are cleared with an empty publish.
        let published = client.published.lock();
        assert_eq!(published.last().unwrap().uri, uri("/w/a.rs"));
        assert!(published.last().unwrap().diagnostics.is_empty());
        let count = published.len();
        drop(published);

        // Forgetting a file that was never diagnosed publishes nothing.
        scheduler.forget(&uri("/w/b.rs"));
        assert_eq!(client.published.lock().len(), count);
    }

    #[tokio::test]
    async fn test_nested_views_do_not_discard_each_other() {
        let client = Arc::new(RecordingClient::default());
        let scheduler = DiagnosticScheduler::new(
            Arc::clone(&client) as Arc<dyn Client>,
            Arc::new(EverythingIsBroken),
        );

        let session = Session::new(EngineOptions::default());
        session.create_view("outer", uri("/w")).unwrap();
        // Raise the outer view's generation well past where the inner view
        // will start.
        for v in 1..=4 {
            session
                .did_modify_files(&[change("/w/x.rs", v, "x")])
                .unwrap()
                .release();
        }
        session.create_view("inner", uri("/w/sub")).unwrap();

        // A file under both roots produces one snapshot per view, with
        // generations that are not comparable across views.
        let affected = session
            .did_modify_files(&[change("/w/sub/a.rs", 1, "a")])
            .unwrap();
        assert_eq!(affected.len(), 2);
        scheduler.schedule(affected, false).wait().await;

        let published = client.published.lock();
        let for_a = published
            .iter()
            .filter(|p| p.uri == uri("/w/sub/a.rs"))
            .count();
        assert_eq!(for_a, 2, "each view's diagnostics must publish");
    }

    #[test]
    fn test_conflict_marker_diagnoser() {
        let session = Session::new(EngineOptions::default());
        session.create_view("w", uri("/w")).unwrap();
        let affected = session
            .did_modify_files(&[change(
                "/w/a.rs",
                1,
                "fn f() {}\n<<<<<<< HEAD\nours\n=======\ntheirs\n>>>>>>> branch\n",
            )])
            .unwrap();
        let snap = affected.iter().next().unwrap();
        let results = ConflictMarkerDiagnoser.diagnose(snap).unwrap();
        let (_, diags) = &results[0];
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].range.start.line, 1);
        assert_eq!(diags[1].range.start.line, 5);
    }
}
