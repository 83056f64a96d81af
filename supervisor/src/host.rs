//! Wiring between config, sources and the supervisor for each CLI command.

use std::collections::HashSet;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::candidate::{CodeCandidate, payload_digest};
use crate::exit_codes;
use crate::io::attempt_log::AttemptLog;
use crate::io::config::{RestartTarget, SupervisorConfig, load_config};
use crate::io::init::{StatePaths, config_base_dir};
use crate::io::replace::{ExecRestarter, NoRestart, Restarter, read_live};
use crate::io::report::{RejectionReport, ReportSink, render_report};
use crate::io::validator::{ProcessValidator, ValidationResult, Validator};
use crate::io::version_store::{VersionRecord, VersionStore};
use crate::sources::export::scan_export;
use crate::sources::hub::{HubScanner, spawn_hub_scanner};
use crate::sources::paste::{PasteReader, run_paste_source};
use crate::sources::{self, CandidateFunnel};
use crate::supervisor::{AttemptOutcome, LoopStop, Supervisor};

/// Resolved configuration plus a usable state directory.
#[derive(Debug, Clone)]
pub struct Host {
    pub config: SupervisorConfig,
    pub paths: StatePaths,
}

impl Host {
    /// Load `config_path`, resolve relative paths, and prepare the state
    /// directories. Unusable state directories surface as a `StartupError`.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config = load_config(config_path)?.resolved(&config_base_dir(config_path));
        let paths = StatePaths::new(&config);
        paths.ensure()?;
        Ok(Self { config, paths })
    }

    pub fn store(&self) -> Result<VersionStore> {
        Ok(VersionStore::open(
            &self.paths.versions_dir,
            &self.paths.live_path,
        )?)
    }

    pub fn validator(&self) -> ProcessValidator {
        let validation = &self.config.validation;
        ProcessValidator {
            launcher: validation.launcher.clone(),
            scratch_dir: self.paths.scratch_dir.clone(),
            scratch_suffix: ProcessValidator::scratch_suffix_for(&self.paths.live_path),
            timeout: Duration::from_secs(validation.timeout_secs),
            output_limit_bytes: validation.output_limit_bytes,
        }
    }

    pub fn restarter(&self) -> Result<ExecRestarter> {
        match self.config.restart.target {
            RestartTarget::Current => ExecRestarter::current_process(),
            RestartTarget::Payload => Ok(ExecRestarter::payload(
                &self.config.validation.launcher,
                &self.paths.live_path,
            )),
        }
    }

    pub fn supervisor<R: Restarter>(&self, restarter: R) -> Result<Supervisor<ProcessValidator, R>> {
        Ok(Supervisor::new(
            &self.paths.live_path,
            self.store()?,
            self.validator(),
            restarter,
            Box::new(ReportSink::new(&self.paths.reports_dir)),
        )
        .with_attempt_log(self.attempt_log()))
    }

    pub fn attempt_log(&self) -> AttemptLog {
        AttemptLog::new(&self.paths.attempts_path)
    }

    /// Digests the automatic sources must not offer again: the live payload
    /// plus everything an earlier process already validated.
    pub fn known_digests(&self) -> HashSet<String> {
        let mut known = self.attempt_log().digests().unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "cannot read attempt log");
            HashSet::new()
        });
        if let Ok(live) = read_live(&self.paths.live_path) {
            known.insert(payload_digest(live.as_bytes()));
        }
        known
    }
}

/// Options for [`run`].
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Read paste captures from stdin.
    pub read_stdin: bool,
}

/// Long-running mode: funnel every configured source into the supervisor
/// until a restart or until the sources are exhausted.
pub fn run(host: &Host, options: RunOptions) -> Result<i32> {
    let supervisor = host.supervisor(host.restarter()?)?;
    let (funnel, candidates) = sources::channel();
    let known = host.known_digests();

    queue_export_blocks(host, &funnel, &known);

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let hub = start_hub(host, &funnel, known, stop_rx)?;

    // Dropping the last stop sender ends the hub scanner.
    let mut hub_stop = Some(stop_tx);
    if options.read_stdin {
        let paste_funnel = funnel.clone();
        let prefixes = host.config.sources.export.block_prefixes.clone();
        let stop_on_exit = hub_stop.take();
        thread::spawn(move || {
            let reader = PasteReader::new(BufReader::new(io::stdin()), prefixes);
            if let Err(err) = run_paste_source(reader, &paste_funnel) {
                warn!(err = %err, "paste source failed");
            }
            drop(stop_on_exit);
        });
        info!(
            "paste code with ':paste [reason]' ... ':end'; ':quit' exits; \
             pastes still queued when an upgrade restarts are lost"
        );
    }
    drop(funnel);

    let stop = supervisor.run(candidates, |_| {});
    drop(hub_stop);
    if let Some(handle) = hub
        && stop == LoopStop::SourcesClosed
        && handle.join().is_err()
    {
        warn!("hub scanner thread panicked");
    }
    Ok(match stop {
        LoopStop::Restarted | LoopStop::SourcesClosed => exit_codes::OK,
        LoopStop::RestartFailed => exit_codes::RESTART_REQUIRED,
    })
}

fn queue_export_blocks(host: &Host, funnel: &CandidateFunnel, known: &HashSet<String>) {
    let export = &host.config.sources.export;
    let Some(path) = &export.path else {
        return;
    };
    match scan_export(path, &export.block_prefixes) {
        Ok(blocks) => {
            let before = blocks.len();
            let fresh: Vec<_> = blocks
                .into_iter()
                .filter(|raw| !known.contains(&payload_digest(&raw.bytes)))
                .collect();
            if fresh.len() < before {
                info!(skipped = before - fresh.len(), "export blocks already attempted");
            }
            for raw in fresh {
                // Malformed blocks are logged by the funnel and skipped.
                let _ = funnel.offer(raw);
            }
        }
        Err(err) => warn!(err = %format!("{err:#}"), "skipping chat export"),
    }
}

fn start_hub(
    host: &Host,
    funnel: &CandidateFunnel,
    known: HashSet<String>,
    stop: mpsc::Receiver<()>,
) -> Result<Option<thread::JoinHandle<()>>> {
    let hub = &host.config.sources.hub;
    let Some(mut scanner) = HubScanner::from_config(hub)? else {
        return Ok(None);
    };
    for digest in known {
        scanner.mark_seen(digest);
    }
    Ok(Some(spawn_hub_scanner(
        scanner,
        Duration::from_secs(hub.interval_secs),
        funnel.clone(),
        stop,
    )))
}

/// Read candidate text from `source` (`-` is stdin).
pub fn read_candidate(source: &Path, reason: Option<&str>) -> Result<CodeCandidate> {
    let (bytes, default_reason) = if source == Path::new("-") {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .context("read candidate from stdin")?;
        (buf, "submit: stdin".to_string())
    } else {
        let buf = std::fs::read(source)
            .with_context(|| format!("read candidate {}", source.display()))?;
        (buf, format!("submit: {}", source.display()))
    };
    let provenance = reason.map_or(default_reason, str::to_string);
    Ok(CodeCandidate::from_bytes(bytes, provenance)?)
}

/// One upgrade attempt without restarting.
pub fn submit_once(host: &Host, candidate: CodeCandidate) -> Result<i32> {
    let supervisor = host.supervisor(NoRestart)?;
    let outcome = supervisor.submit(candidate);
    Ok(report_one_shot(&outcome, &host.paths.live_path))
}

/// Roll the live payload back to archived version `id`.
///
/// The old payload goes through the same validate/backup/replace path as
/// any other candidate, so the payload it replaces is archived too.
pub fn rollback(host: &Host, id: &str) -> Result<i32> {
    let record = host.store()?.get(id)?;
    let candidate = CodeCandidate::new(record.payload, format!("rollback:{id}"))?;
    submit_once(host, candidate)
}

fn report_one_shot(outcome: &AttemptOutcome, live_path: &Path) -> i32 {
    match outcome {
        AttemptOutcome::Unchanged => {
            println!("unchanged: candidate matches {}", live_path.display());
            exit_codes::OK
        }
        AttemptOutcome::Committed { record, .. } => {
            println!(
                "committed: {} replaced, previous version archived as {}",
                live_path.display(),
                record.id
            );
            println!("restart the running process to pick up the new payload");
            exit_codes::OK
        }
        AttemptOutcome::Rejected(_) => exit_codes::REJECTED,
        AttemptOutcome::RestartFailed { error, .. } => {
            eprintln!("{error}");
            exit_codes::RESTART_REQUIRED
        }
        AttemptOutcome::Aborted(error) => {
            eprintln!("upgrade aborted: {error}");
            exit_codes::INVALID
        }
    }
}

/// Validate without committing.
pub fn check(host: &Host, candidate: &CodeCandidate) -> Result<i32> {
    let result = host.validator().validate(candidate);
    print_check(candidate, &result)
}

fn print_check(candidate: &CodeCandidate, result: &ValidationResult) -> Result<i32> {
    if result.passed() {
        println!("pass ({} ms)", result.duration_ms);
        if !result.output.is_empty() {
            print!("{}", result.output);
        }
        return Ok(exit_codes::OK);
    }
    let report = RejectionReport::new(candidate, result);
    eprint!("{}", render_report(&report, None)?);
    Ok(exit_codes::REJECTED)
}

/// One row of `supervisor versions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSummary {
    pub id: String,
    pub stored_at: String,
    pub bytes: usize,
    pub digest: String,
}

impl From<&VersionRecord> for VersionSummary {
    fn from(record: &VersionRecord) -> Self {
        Self {
            id: record.id.clone(),
            stored_at: record.stored_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            bytes: record.payload.len(),
            digest: payload_digest(record.payload.as_bytes())[..12].to_string(),
        }
    }
}

pub fn versions(host: &Host) -> Result<Vec<VersionSummary>> {
    Ok(host
        .store()?
        .list()?
        .iter()
        .map(VersionSummary::from)
        .collect())
}

pub fn show(host: &Host, id: &str) -> Result<String> {
    Ok(host.store()?.get(id)?.payload)
}

/// Config path from `--config`, or `supervisor.toml` in the working directory.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| PathBuf::from(crate::io::config::DEFAULT_CONFIG_FILE))
}
