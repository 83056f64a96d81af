//! Error taxonomy for upgrade attempts.
//!
//! Validation failures are their own type, [`ValidationFailure`], carried
//! inside a rejection report rather than raised as an [`UpgradeError`]. Backup and replace failures abort one attempt.
//! Only [`StartupError`] is allowed to end the process.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a candidate's self-test did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFailure {
    /// The child did not exit within the configured timeout and was killed.
    #[error("self-test timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// The child could not be started or was terminated by a signal.
    #[error("self-test crashed: {detail}")]
    Crash { detail: String },
    /// The child exited on its own with a non-zero status.
    #[error("self-test exited with status {code}")]
    NonZeroExit { code: i32 },
}

/// Failure of a single upgrade attempt.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Empty or non-text input, rejected before any process is spawned.
    #[error("malformed candidate from '{provenance}': {reason}")]
    MalformedCandidate { provenance: String, reason: String },

    /// The live payload could not be archived; the live file is untouched.
    #[error("back up live payload to {}: {source}", path.display())]
    BackupIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The atomic swap failed; the previous live file is still in place.
    #[error("replace live payload {}: {source}", path.display())]
    ReplaceIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The new payload is live on disk but this process could not hand off.
    #[error("restart into new payload failed (manual restart required): {detail}")]
    RestartFailure { detail: String },
}

/// Unrecoverable condition detected while the supervisor starts.
#[derive(Debug, Error)]
#[error("state directory {} is unusable: {source}", path.display())]
pub struct StartupError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}
