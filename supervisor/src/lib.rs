//! Self-upgrade supervisor for long-running agent processes.
//!
//! A candidate replacement for the live program is validated in an isolated
//! child process and only then committed: the current payload is archived,
//! the live file is swapped atomically, and the process re-executes itself.
//!
//! - **[`candidate`]**: immutable candidate values and input normalization.
//! - **[`sources`]**: producers that funnel candidates into a single queue.
//! - **[`io`]**: side-effecting pieces (config, version archive, child
//!   process validation, atomic replace and restart, reports).
//! - **[`supervisor`]**: the state machine that serializes upgrade attempts.
//!
//! [`host`] wires these together for the CLI commands.

pub mod candidate;
pub mod error;
pub mod exit_codes;
pub mod host;
pub mod io;
pub mod logging;
pub mod sources;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
