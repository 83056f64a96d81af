//! Out-of-process self-test of candidate payloads.
//!
//! The [`Validator`] trait decouples the supervisor from how a candidate is
//! exercised. [`ProcessValidator`] writes the payload to a scratch file and
//! runs it as a separate OS process with [`SELF_TEST_FLAG`]; tests use
//! scripted validators that return predetermined results.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tracing::{info, instrument, warn};

use crate::candidate::CodeCandidate;
use crate::error::ValidationFailure;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Argument passed to every candidate under test. Stable across versions:
/// an old supervisor must be able to validate its successor's successor.
pub const SELF_TEST_FLAG: &str = "--self-test";

/// Set to `1` in the self-test child's environment.
pub const SELF_TEST_ENV: &str = "SUPERVISOR_SELF_TEST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// Result of one self-test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub outcome: Outcome,
    /// Captured stdout then stderr, capped.
    pub output: String,
    pub duration_ms: u64,
    /// Set exactly when `outcome` is `Fail`.
    pub failure: Option<ValidationFailure>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    fn fail(failure: ValidationFailure, output: String, duration: Duration) -> Self {
        Self {
            outcome: Outcome::Fail,
            output,
            duration_ms: duration_ms(duration),
            failure: Some(failure),
        }
    }
}

/// Decides whether a candidate may become the live payload.
///
/// Implementations never run the candidate inside the calling process and
/// never return errors: anything that goes wrong is a `Fail` result.
pub trait Validator: Send + Sync {
    fn validate(&self, candidate: &CodeCandidate) -> ValidationResult;
}

/// Validator that runs the candidate as a child process.
#[derive(Debug, Clone)]
pub struct ProcessValidator {
    /// Command prefix; empty runs the scratch file directly.
    pub launcher: Vec<String>,
    /// Where scratch copies of candidates are written. Never the live file.
    pub scratch_dir: PathBuf,
    /// Suffix for scratch files, so launchers that care about extensions work.
    pub scratch_suffix: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ProcessValidator {
    /// Scratch files reuse the live file's extension (`agent.py` -> `.py`).
    pub fn scratch_suffix_for(live_path: &Path) -> String {
        live_path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }

    fn write_scratch(&self, candidate: &CodeCandidate) -> Result<TempPath> {
        fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("create scratch dir {}", self.scratch_dir.display()))?;
        let mut file = tempfile::Builder::new()
            .prefix("candidate-")
            .suffix(&self.scratch_suffix)
            .tempfile_in(&self.scratch_dir)
            .with_context(|| format!("create scratch file in {}", self.scratch_dir.display()))?;
        file.write_all(candidate.payload().as_bytes())
            .context("write scratch file")?;
        file.as_file().sync_all().context("sync scratch file")?;
        if self.launcher.is_empty() {
            make_executable(file.path())?;
        }
        // Close the handle: exec'ing a file that is still open for writing fails with ETXTBSY.
        Ok(file.into_temp_path())
    }

    fn command_for(&self, script: &Path) -> Command {
        let mut cmd = match self.launcher.split_first() {
            Some((program, args)) => {
                let mut cmd = Command::new(program);
                cmd.args(args).arg(script);
                cmd
            }
            None => Command::new(script),
        };
        cmd.arg(SELF_TEST_FLAG)
            .env(SELF_TEST_ENV, "1")
            .current_dir(&self.scratch_dir);
        cmd
    }
}

impl Validator for ProcessValidator {
    #[instrument(skip_all, fields(provenance = %candidate.provenance(), timeout_ms = self.timeout.as_millis() as u64))]
    fn validate(&self, candidate: &CodeCandidate) -> ValidationResult {
        let started = Instant::now();
        let scratch = match self.write_scratch(candidate) {
            Ok(path) => path,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not stage candidate for self-test");
                return ValidationResult::fail(
                    ValidationFailure::Crash {
                        detail: format!("stage scratch file: {err:#}"),
                    },
                    String::new(),
                    started.elapsed(),
                );
            }
        };

        let cmd = self.command_for(&scratch);
        let output = match run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "self-test could not start");
                return ValidationResult::fail(
                    ValidationFailure::Crash {
                        detail: format!("{err:#}"),
                    },
                    String::new(),
                    started.elapsed(),
                );
            }
        };
        drop(scratch);

        let result = classify(&output, self.timeout, self.output_limit_bytes);
        info!(outcome = ?result.outcome, duration_ms = result.duration_ms, "self-test finished");
        result
    }
}

fn classify(output: &CommandOutput, timeout: Duration, limit: usize) -> ValidationResult {
    let captured = combined_output(output, limit);
    if output.timed_out {
        return ValidationResult::fail(
            ValidationFailure::Timeout {
                timeout_ms: duration_ms(timeout),
            },
            captured,
            output.elapsed,
        );
    }
    if output.status.success() {
        return ValidationResult {
            outcome: Outcome::Pass,
            output: captured,
            duration_ms: duration_ms(output.elapsed),
            failure: None,
        };
    }
    let failure = match output.status.code() {
        Some(code) => ValidationFailure::NonZeroExit { code },
        None => ValidationFailure::Crash {
            detail: describe_signal(&output.status),
        },
    };
    ValidationResult::fail(failure, captured, output.elapsed)
}

/// Stdout followed by stderr, with truncation notices, capped at `limit` bytes.
fn combined_output(output: &CommandOutput, limit: usize) -> String {
    let mut buf = String::new();
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("self-test"));
    if !output.stderr.is_empty() && !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("self-test"));
    truncate_on_char_boundary(buf, limit)
}

fn truncate_on_char_boundary(mut buf: String, limit: usize) -> String {
    if buf.len() <= limit {
        return buf;
    }
    let dropped = buf.len() - limit;
    let mut cut = limit;
    while !buf.is_char_boundary(cut) {
        cut -= 1;
    }
    buf.truncate(cut);
    buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    buf
}

#[cfg(unix)]
fn describe_signal(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => format!("abnormal exit ({status})"),
    }
}

#[cfg(not(unix))]
fn describe_signal(status: &std::process::ExitStatus) -> String {
    format!("abnormal exit ({status})")
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn validator(scratch: &Path, timeout: Duration) -> ProcessValidator {
        ProcessValidator {
            launcher: vec!["sh".to_string()],
            scratch_dir: scratch.to_path_buf(),
            scratch_suffix: ".sh".to_string(),
            timeout,
            output_limit_bytes: 4096,
        }
    }

    fn candidate(script: &str) -> CodeCandidate {
        CodeCandidate::new(script, "test").expect("candidate")
    }

    #[test]
    fn passes_when_self_test_exits_zero() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = validator(temp.path(), Duration::from_secs(10)).validate(&candidate(
            "if [ \"$1\" = \"--self-test\" ] && [ \"$SUPERVISOR_SELF_TEST\" = 1 ]; then echo ready; exit 0; fi\nexit 9\n",
        ));

        assert_eq!(result.outcome, Outcome::Pass);
        assert_eq!(result.output, "ready\n");
        assert!(result.failure.is_none());
    }

    #[test]
    fn nonzero_exit_fails_with_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = validator(temp.path(), Duration::from_secs(10))
            .validate(&candidate("echo 'Traceback: NameError' >&2\nexit 3\n"));

        assert_eq!(result.outcome, Outcome::Fail);
        assert_eq!(
            result.failure,
            Some(ValidationFailure::NonZeroExit { code: 3 })
        );
        assert!(result.output.contains("NameError"));
    }

    #[test]
    fn signal_termination_is_a_crash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result =
            validator(temp.path(), Duration::from_secs(10)).validate(&candidate("kill -9 $$\n"));

        assert_eq!(result.outcome, Outcome::Fail);
        assert!(matches!(
            result.failure,
            Some(ValidationFailure::Crash { ref detail }) if detail.contains("signal 9")
        ));
    }

    #[test]
    fn missing_launcher_is_a_crash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut validator = validator(temp.path(), Duration::from_secs(1));
        validator.launcher = vec!["/nonexistent/interpreter".to_string()];

        let result = validator.validate(&candidate("exit 0\n"));
        assert_eq!(result.outcome, Outcome::Fail);
        assert!(matches!(result.failure, Some(ValidationFailure::Crash { .. })));
    }

    #[test]
    fn direct_execution_without_launcher() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut validator = validator(temp.path(), Duration::from_secs(10));
        validator.launcher.clear();

        let result = validator.validate(&candidate("#!/bin/sh\necho \"flag=$1\"\n"));
        assert_eq!(result.outcome, Outcome::Pass);
        assert_eq!(result.output, "flag=--self-test\n");
    }

    #[test]
    fn timeout_fails_and_reports_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = validator(temp.path(), Duration::from_millis(300))
            .validate(&candidate("while true; do :; done\n"));

        assert_eq!(result.outcome, Outcome::Fail);
        assert_eq!(
            result.failure,
            Some(ValidationFailure::Timeout { timeout_ms: 300 })
        );
        assert!(result.duration_ms >= 300);
    }

    #[test]
    fn runaway_output_is_capped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut validator = validator(temp.path(), Duration::from_secs(10));
        validator.output_limit_bytes = 64;

        let result = validator.validate(&candidate(
            "i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done\n",
        ));
        assert_eq!(result.outcome, Outcome::Pass);
        assert!(result.output.len() < 128);
        assert!(result.output.contains("truncated"));
    }

    #[test]
    fn scratch_files_are_removed_and_live_dir_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let scratch = temp.path().join("scratch");
        validator(&scratch, Duration::from_secs(10)).validate(&candidate("exit 0\n"));

        let leftovers = fs::read_dir(&scratch).expect("read scratch").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn revalidation_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let validator = validator(temp.path(), Duration::from_secs(10));
        let good = candidate("echo ready\n");
        let bad = candidate("exit 4\n");

        assert_eq!(
            validator.validate(&good).outcome,
            validator.validate(&good).outcome
        );
        assert_eq!(
            validator.validate(&bad).failure,
            validator.validate(&bad).failure
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ééééé".to_string();
        let cut = truncate_on_char_boundary(text, 3);
        assert!(cut.starts_with('é'));
        assert!(cut.contains("[truncated"));
    }

    #[test]
    fn scratch_suffix_follows_live_extension() {
        assert_eq!(
            ProcessValidator::scratch_suffix_for(Path::new("/srv/agent.py")),
            ".py"
        );
        assert_eq!(
            ProcessValidator::scratch_suffix_for(Path::new("/srv/agent")),
            ""
        );
    }
}
