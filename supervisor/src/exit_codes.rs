//! Stable exit codes for supervisor CLI commands.

/// Command succeeded, or the supervisor shut down normally.
pub const OK: i32 = 0;
/// Invalid usage or config, or an upgrade attempt aborted on I/O.
pub const INVALID: i32 = 1;
/// The state directories (version archive, scratch, reports) are unusable.
pub const ENVIRONMENT: i32 = 2;
/// A one-shot command's candidate failed validation.
pub const REJECTED: i32 = 3;
/// The new payload is live on disk but the process could not hand off to it.
pub const RESTART_REQUIRED: i32 = 4;
