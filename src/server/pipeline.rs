//! Modification pipeline
//!
//! Ingests discrete edit batches, debounces bursty on-disk batches, and
//! hands ordered batches to the session. One lock serializes "append to
//! pending" and "apply", which guarantees the ordering invariant:
//! modifications are applied in the exact order they were submitted, within
//! a batch and across the batches forming one flush. Coalescing changes
//! batching granularity, never order, and never drops a batch.
//!
//! The debounce logic is an explicit state machine {Idle, Accumulating,
//! Flushing} with a single timer generation owned by the pipeline. Every
//! on-disk submission bumps the generation and arms a fresh timer; a timer
//! that wakes to find itself stale exits without flushing.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::file::{FileAction, Modification, ModificationSource};
use crate::session::Session;

use super::diagnostics::DiagnosticScheduler;
use super::latch::Latch;
use super::{Client, ProgressEvent};

/// Debounce phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Accumulating,
    Flushing,
}

/// One submitted batch waiting out the debounce window.
struct PendingBatch {
    changes: Vec<Modification>,
    done: Latch,
}

struct PipelineState {
    phase: Phase,
    pending: Vec<PendingBatch>,
    /// Bumped by every on-disk submission; identifies the armed timer.
    timer_generation: u64,
    /// Completion signal of the most recently submitted batch, so teardown
    /// can grant in-flight diagnosis a bounded grace period.
    last_batch: Option<Latch>,
}

/// Serializes batch application and coalesces on-disk bursts.
///
/// Cloning is cheap; clones share the pending state and write lock.
#[derive(Clone)]
pub struct ModificationPipeline {
    session: Arc<Session>,
    scheduler: DiagnosticScheduler,
    client: Arc<dyn Client>,
    state: Arc<Mutex<PipelineState>>,
}

impl ModificationPipeline {
    pub fn new(
        session: Arc<Session>,
        scheduler: DiagnosticScheduler,
        client: Arc<dyn Client>,
    ) -> Self {
        Self {
            session,
            scheduler,
            client,
            state: Arc::new(Mutex::new(PipelineState {
                phase: Phase::Idle,
                pending: Vec::new(),
                timer_generation: 0,
                last_batch: None,
            })),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Completion signal of the most recently submitted batch, if any.
    pub fn last_batch(&self) -> Option<Latch> {
        self.state.lock().last_batch.clone()
    }

    /// Submit one ordered batch of modifications.
    ///
    /// The returned latch opens once diagnosis of the snapshot(s) resulting
    /// from these modifications has finished. Batches not originating from
    /// on-disk watch events, or submitted with a zero debounce delay, are
    /// applied immediately and synchronously relative to other batches.
    pub fn submit(&self, mods: Vec<Modification>, source: ModificationSource) -> Result<Latch> {
        let done = Latch::new();
        if self.session.options().verbose_progress {
            self.emit_progress(source, done.clone());
        }

        let on_disk = source == ModificationSource::DidChangeWatchedFiles;
        let delay = self.session.options().watched_file_delay;

        if !on_disk || delay.is_zero() {
            let mut state = self.state.lock();
            state.last_batch = Some(done.clone());
            let result = self.process(mods, on_disk, done.clone());
            drop(state);
            return result.map(|_| done);
        }

        if self.session.is_shut_down() {
            done.open();
            return Err(EngineError::ShutDown);
        }

        let generation = {
            let mut state = self.state.lock();
            state.last_batch = Some(done.clone());
            state.pending.push(PendingBatch {
                changes: mods,
                done: done.clone(),
            });
            if state.phase == Phase::Idle {
                state.phase = Phase::Accumulating;
            }
            state.timer_generation += 1;
            state.timer_generation
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.flush(generation).await;
        });
        Ok(done)
    }

    /// Flush every pending batch accumulated since the last flush, in
    /// arrival order, as one combined batch with one diagnosis pass.
    async fn flush(&self, generation: u64) {
        // Drain and apply under one lock acquisition so no other flush or
        // immediate-path batch can slot in between the two.
        let (combined, dones) = {
            let mut state = self.state.lock();
            if state.timer_generation != generation {
                // A later submission re-armed the timer.
                return;
            }
            state.phase = Phase::Flushing;
            let batches = std::mem::take(&mut state.pending);

            let mut all_changes = Vec::new();
            let mut dones = Vec::with_capacity(batches.len());
            for batch in batches {
                all_changes.extend(batch.changes);
                dones.push(batch.done);
            }
            (self.process(all_changes, true, Latch::new()), dones)
        };

        match combined {
            Ok(latch) => {
                // Every coalesced batch's signal opens only after the single
                // combined diagnosis pass finishes.
                latch.wait().await;
            }
            Err(e) => {
                tracing::error!("processing delayed file changes: {e}");
            }
        }
        for done in dones {
            done.open();
        }

        let mut state = self.state.lock();
        state.phase = if state.pending.is_empty() {
            Phase::Idle
        } else {
            Phase::Accumulating
        };
    }

    /// Apply one batch under the caller-held write lock and kick off
    /// diagnosis. Returns the diagnosis latch.
    fn process(&self, mods: Vec<Modification>, on_disk: bool, done: Latch) -> Result<Latch> {
        if self.session.is_shut_down() {
            done.open();
            return Err(EngineError::ShutDown);
        }
        let mods = self.session.expand_modifications_to_directories(mods);
        let affected = match self.session.did_modify_files(&mods) {
            Ok(affected) => affected,
            Err(e) => {
                done.open();
                return Err(e);
            }
        };
        for m in &mods {
            if m.action == FileAction::Delete {
                self.scheduler.forget(&m.uri);
            }
        }
        let latch = self.scheduler.schedule(affected, on_disk);
        link(latch.clone(), done);
        Ok(latch)
    }

    /// Emit "diagnosing ..." now and "Done." once the batch's diagnosis
    /// completes.
    fn emit_progress(&self, source: ModificationSource, done: Latch) {
        let token = uuid::Uuid::new_v4().to_string();
        self.client.progress(ProgressEvent::Begin {
            token: token.clone(),
            title: format!("diagnosing {source}"),
        });
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            done.wait().await;
            client.progress(ProgressEvent::End {
                token,
                message: "Done.".to_string(),
            });
        });
    }
}

/// Open `done` once `latch` opens.
fn link(latch: Latch, done: Latch) {
    tokio::spawn(async move {
        latch.wait().await;
        done.open();
    });
}
