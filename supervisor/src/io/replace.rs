//! Atomic live-file replacement and process hand-off.
//!
//! This is the only platform-specific part of an upgrade. On unix the
//! restart replaces the current process image (`exec`), so two generations
//! never run side by side. Elsewhere the new process is spawned and the old
//! one exits, leaving a short window where both are alive.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::error::UpgradeError;

/// Read the live payload as text.
pub fn read_live(live_path: &Path) -> Result<String> {
    fs::read_to_string(live_path).with_context(|| format!("read live payload {}", live_path.display()))
}

/// Replace the contents of `live_path` with `payload`.
///
/// Writes a temp file in the same directory, syncs it, then renames it over
/// the live file. Readers see either the old bytes or the new ones. On any
/// error the old file is left in place and the temp file is removed.
#[instrument(skip_all, fields(live = %live_path.display(), bytes = payload.len()))]
pub fn replace_live(live_path: &Path, payload: &str) -> Result<(), UpgradeError> {
    let replace_err = |source: io::Error| UpgradeError::ReplaceIo {
        path: live_path.to_path_buf(),
        source,
    };

    let dir = live_dir(live_path);
    let mut tmp = tempfile::Builder::new()
        .prefix(".live-")
        .tempfile_in(&dir)
        .map_err(replace_err)?;
    tmp.write_all(payload.as_bytes()).map_err(replace_err)?;
    if let Ok(meta) = fs::metadata(live_path) {
        fs::set_permissions(tmp.path(), meta.permissions()).map_err(replace_err)?;
    }
    tmp.as_file().sync_all().map_err(replace_err)?;
    tmp.persist(live_path).map_err(|err| replace_err(err.error))?;
    sync_dir(&dir);

    info!("live payload replaced");
    Ok(())
}

fn live_dir(live_path: &Path) -> PathBuf {
    match live_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        warn!(err = %err, dir = %dir.display(), "failed to sync directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// What happened when a restart was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Restarting is disabled (one-shot commands, tests).
    NotRequested,
    /// Control was handed to a new process. Only observable from fakes and
    /// the non-unix fallback; a real `exec` never returns on success.
    HandedOff,
}

/// Hands control to the freshly committed payload.
pub trait Restarter: Send + Sync {
    fn restart(&self) -> Result<RestartOutcome, UpgradeError>;
}

/// Restarter that replaces the current process with `program args..`.
#[derive(Debug, Clone)]
pub struct ExecRestarter {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ExecRestarter {
    /// Re-exec the running binary with its original arguments.
    pub fn current_process() -> Result<Self> {
        let program = std::env::current_exe().context("locate current executable")?;
        Ok(Self {
            program,
            args: std::env::args_os().skip(1).collect(),
        })
    }

    /// Exec the live payload through `launcher` (or directly when it is empty).
    pub fn payload(launcher: &[String], live_path: &Path) -> Self {
        match launcher.split_first() {
            Some((program, rest)) => Self {
                program: PathBuf::from(program),
                args: rest
                    .iter()
                    .map(OsString::from)
                    .chain(std::iter::once(live_path.as_os_str().to_os_string()))
                    .collect(),
            },
            None => Self {
                program: live_path.to_path_buf(),
                args: Vec::new(),
            },
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl Restarter for ExecRestarter {
    #[cfg(unix)]
    fn restart(&self) -> Result<RestartOutcome, UpgradeError> {
        use std::os::unix::process::CommandExt;

        info!(program = %self.program.display(), "replacing process image");
        let err = self.command().exec();
        Err(UpgradeError::RestartFailure {
            detail: format!("exec {}: {err}", self.program.display()),
        })
    }

    #[cfg(not(unix))]
    fn restart(&self) -> Result<RestartOutcome, UpgradeError> {
        info!(program = %self.program.display(), "spawning replacement process and exiting");
        self.command()
            .spawn()
            .map_err(|err| UpgradeError::RestartFailure {
                detail: format!("spawn {}: {err}", self.program.display()),
            })?;
        std::process::exit(crate::exit_codes::OK);
    }
}

/// Restarter that never restarts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRestart;

impl Restarter for NoRestart {
    fn restart(&self) -> Result<RestartOutcome, UpgradeError> {
        Ok(RestartOutcome::NotRequested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_contents_and_leaves_no_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let live = temp.path().join("agent.py");
        fs::write(&live, "old\n").expect("write live");

        replace_live(&live, "new\n").expect("replace");

        assert_eq!(read_live(&live).expect("read"), "new\n");
        let names: Vec<String> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["agent.py".to_string()]);
    }

    #[test]
    fn replace_creates_missing_live_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let live = temp.path().join("agent.py");

        replace_live(&live, "fresh\n").expect("replace");
        assert_eq!(read_live(&live).expect("read"), "fresh\n");
    }

    #[cfg(unix)]
    #[test]
    fn replace_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let live = temp.path().join("agent.sh");
        fs::write(&live, "old\n").expect("write live");
        fs::set_permissions(&live, fs::Permissions::from_mode(0o750)).expect("chmod");

        replace_live(&live, "new\n").expect("replace");

        let mode = fs::metadata(&live).expect("stat").permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn replace_into_missing_dir_is_replace_io_and_touches_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let live = temp.path().join("gone").join("agent.py");

        let err = replace_live(&live, "new").unwrap_err();
        assert!(matches!(err, UpgradeError::ReplaceIo { .. }));
        assert!(!live.exists());
    }

    #[test]
    fn payload_restarter_appends_live_path_to_launcher() {
        let restarter = ExecRestarter::payload(
            &["python3".to_string(), "-u".to_string()],
            Path::new("/srv/agent.py"),
        );
        assert_eq!(restarter.program, PathBuf::from("python3"));
        assert_eq!(
            restarter.args,
            vec![OsString::from("-u"), OsString::from("/srv/agent.py")]
        );

        let direct = ExecRestarter::payload(&[], Path::new("/srv/agent"));
        assert_eq!(direct.program, PathBuf::from("/srv/agent"));
        assert!(direct.args.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn exec_of_missing_program_is_restart_failure() {
        let restarter = ExecRestarter {
            program: PathBuf::from("/nonexistent/agent-binary"),
            args: Vec::new(),
        };
        let err = restarter.restart().unwrap_err();
        assert!(matches!(err, UpgradeError::RestartFailure { .. }));
    }

    #[test]
    fn no_restart_reports_not_requested() {
        assert_eq!(
            NoRestart.restart().expect("restart"),
            RestartOutcome::NotRequested
        );
    }
}
