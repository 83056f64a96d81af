//! Upgrade state machine.
//!
//! One attempt runs `Idle -> Validating -> {Committing | Rejecting} -> (Idle | Restarting)`.
//! Attempts are serialized by a lock held for the whole attempt, so a backup
//! always captures the payload that the commit is about to replace.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, info, instrument, warn};

use crate::candidate::{CodeCandidate, payload_digest};
use crate::error::UpgradeError;
use crate::io::attempt_log::AttemptLog;
use crate::io::replace::{RestartOutcome, Restarter, read_live, replace_live};
use crate::io::report::RejectionReport;
use crate::io::validator::{Outcome, Validator};
use crate::io::version_store::{VersionRecord, VersionStore};

/// Where the supervisor is within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Committing,
    Rejecting,
    Restarting,
}

/// Per-process supervisor state, rebuilt from disk on every start.
#[derive(Debug)]
pub struct SupervisorState {
    live_path: PathBuf,
    version_store_dir: PathBuf,
    lock: Mutex<()>,
    phase: Mutex<Phase>,
}

impl SupervisorState {
    pub fn new(live_path: impl Into<PathBuf>, version_store_dir: impl Into<PathBuf>) -> Self {
        Self {
            live_path: live_path.into(),
            version_store_dir: version_store_dir.into(),
            lock: Mutex::new(()),
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    pub fn version_store_dir(&self) -> &Path {
        &self.version_store_dir
    }

    pub fn phase(&self) -> Phase {
        *recover(self.phase.lock())
    }

    fn set_phase(&self, to: Phase) -> Phase {
        std::mem::replace(&mut *recover(self.phase.lock()), to)
    }
}

/// A panic inside one attempt must not wedge every later attempt.
fn recover<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Notifications for the operator-facing collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    PhaseChanged { from: Phase, to: Phase },
    Unchanged { provenance: String },
    Rejected(RejectionReport),
    BackupCreated { id: String },
    LiveReplaced { provenance: String },
    /// About to restart; `queued` candidates are still waiting and will not
    /// be attempted by this process.
    HandingOff { queued: usize },
    Aborted { provenance: String, reason: String },
    RestartFailed { reason: String },
}

/// Receives supervisor events. Must not block for long: it is called with
/// the attempt lock held.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SupervisorEvent);
}

/// Result of one call to [`Supervisor::submit`].
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Candidate is byte-identical to the live payload; nothing ran.
    Unchanged,
    /// Self-test failed; the live payload was not touched.
    Rejected(RejectionReport),
    /// Backup taken, live payload replaced, restart attempted.
    Committed {
        record: VersionRecord,
        restart: RestartOutcome,
    },
    /// The new payload is live but the hand-off to it failed.
    RestartFailed {
        record: VersionRecord,
        error: UpgradeError,
    },
    /// Backup or replace failed; the live payload was not touched.
    Aborted(UpgradeError),
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Rejected(_) => "rejected",
            Self::Committed { .. } => "committed",
            Self::RestartFailed { .. } => "restart_failed",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// A commit handed off to a new process.
    Restarted,
    /// A commit went live on disk but could not hand off.
    RestartFailed,
    /// Every candidate source has shut down.
    SourcesClosed,
}

pub struct Supervisor<V, R> {
    state: SupervisorState,
    store: VersionStore,
    validator: V,
    restarter: R,
    sink: Box<dyn EventSink>,
    attempts: Option<AttemptLog>,
}

impl<V: Validator, R: Restarter> Supervisor<V, R> {
    pub fn new(
        live_path: impl Into<PathBuf>,
        store: VersionStore,
        validator: V,
        restarter: R,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let state = SupervisorState::new(live_path, store.dir());
        Self {
            state,
            store,
            validator,
            restarter,
            sink,
            attempts: None,
        }
    }

    /// Record every validated candidate in `log`.
    pub fn with_attempt_log(mut self, log: AttemptLog) -> Self {
        self.attempts = Some(log);
        self
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// Run one upgrade attempt to completion.
    ///
    /// Blocks while another attempt holds the lock. Never panics or returns
    /// an error: every failure is folded into the returned outcome.
    pub fn submit(&self, candidate: CodeCandidate) -> AttemptOutcome {
        self.submit_queued(candidate, 0)
    }

    #[instrument(skip_all, fields(provenance = %candidate.provenance()))]
    fn submit_queued(&self, candidate: CodeCandidate, queued: usize) -> AttemptOutcome {
        let _attempt = recover(self.state.lock.lock());
        let outcome = self.attempt(&candidate, queued);
        self.transition(Phase::Idle);
        info!(outcome = outcome.label(), "attempt finished");
        outcome
    }

    fn attempt(&self, candidate: &CodeCandidate, queued: usize) -> AttemptOutcome {
        let live_path = self.state.live_path();
        let live = match read_live(live_path) {
            Ok(live) => live,
            Err(err) => {
                let error = UpgradeError::BackupIo {
                    path: live_path.to_path_buf(),
                    source: std::io::Error::other(format!("{err:#}")),
                };
                return self.abort(candidate, error);
            }
        };
        if payload_digest(live.as_bytes()) == candidate.digest() {
            self.sink.emit(&SupervisorEvent::Unchanged {
                provenance: candidate.provenance().to_string(),
            });
            return AttemptOutcome::Unchanged;
        }

        self.transition(Phase::Validating);
        let result = self.validator.validate(candidate);
        self.note_attempt(candidate, result.outcome);
        if !result.passed() {
            self.transition(Phase::Rejecting);
            let report = RejectionReport::new(candidate, &result);
            self.sink.emit(&SupervisorEvent::Rejected(report.clone()));
            return AttemptOutcome::Rejected(report);
        }

        self.transition(Phase::Committing);
        let record = match self.store.backup(&live) {
            Ok(record) => record,
            Err(err) => return self.abort(candidate, err),
        };
        self.sink.emit(&SupervisorEvent::BackupCreated {
            id: record.id.clone(),
        });
        if let Err(err) = replace_live(live_path, candidate.payload()) {
            return self.abort(candidate, err);
        }
        self.sink.emit(&SupervisorEvent::LiveReplaced {
            provenance: candidate.provenance().to_string(),
        });

        self.transition(Phase::Restarting);
        if queued > 0 {
            warn!(queued, "restarting with candidates still queued; they are not attempted");
        }
        self.sink.emit(&SupervisorEvent::HandingOff { queued });
        match self.restarter.restart() {
            Ok(restart) => AttemptOutcome::Committed { record, restart },
            Err(error) => {
                error!(err = %error, "restart failed after commit");
                self.sink.emit(&SupervisorEvent::RestartFailed {
                    reason: error.to_string(),
                });
                AttemptOutcome::RestartFailed { record, error }
            }
        }
    }

    /// Must land before the commit: a successful restart never returns.
    fn note_attempt(&self, candidate: &CodeCandidate, outcome: Outcome) {
        let Some(log) = &self.attempts else {
            return;
        };
        if let Err(err) = log.record(candidate, outcome) {
            warn!(err = %format!("{err:#}"), "failed to record attempt");
        }
    }

    fn abort(&self, candidate: &CodeCandidate, error: UpgradeError) -> AttemptOutcome {
        warn!(err = %error, "aborting upgrade attempt");
        self.sink.emit(&SupervisorEvent::Aborted {
            provenance: candidate.provenance().to_string(),
            reason: error.to_string(),
        });
        AttemptOutcome::Aborted(error)
    }

    fn transition(&self, to: Phase) {
        let from = self.state.set_phase(to);
        if from != to {
            debug!(?from, ?to, "phase");
            self.sink.emit(&SupervisorEvent::PhaseChanged { from, to });
        }
    }

    /// Consume candidates from the shared queue until a restart or until
    /// every sender is gone. `on_attempt` sees every outcome.
    ///
    /// Candidates already waiting when an attempt starts are moved to a local
    /// backlog first, so a hand-off can report how many it leaves behind.
    pub fn run(
        &self,
        candidates: Receiver<CodeCandidate>,
        mut on_attempt: impl FnMut(&AttemptOutcome),
    ) -> LoopStop {
        info!(live = %self.state.live_path().display(), "supervisor idle, waiting for candidates");
        let mut backlog = VecDeque::new();
        loop {
            let Some(candidate) = backlog.pop_front().or_else(|| candidates.recv().ok()) else {
                break;
            };
            backlog.extend(candidates.try_iter());
            let outcome = self.submit_queued(candidate, backlog.len());
            on_attempt(&outcome);
            match outcome {
                AttemptOutcome::Committed {
                    restart: RestartOutcome::HandedOff,
                    ..
                } => return LoopStop::Restarted,
                AttemptOutcome::RestartFailed { .. } => return LoopStop::RestartFailed,
                _ => {}
            }
        }
        info!("all candidate sources closed");
        LoopStop::SourcesClosed
    }
}
