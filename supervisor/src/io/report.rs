//! Rejection reports: JSON artifacts plus an operator-facing rendering.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::candidate::CodeCandidate;
use crate::error::ValidationFailure;
use crate::io::validator::{Outcome, ValidationResult};
use crate::supervisor::{EventSink, SupervisorEvent};

const REJECTION_TEMPLATE: &str = include_str!("templates/rejection.txt");
const MAX_REPORTS_PER_SECOND: u32 = 1000;

/// Everything an operator needs to see why a candidate was turned down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionReport {
    pub provenance: String,
    pub received_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub failure: Option<ValidationFailure>,
    pub duration_ms: u64,
    pub output: String,
}

impl RejectionReport {
    pub fn new(candidate: &CodeCandidate, result: &ValidationResult) -> Self {
        Self {
            provenance: candidate.provenance().to_string(),
            received_at: candidate.received_at(),
            outcome: result.outcome,
            failure: result.failure.clone(),
            duration_ms: result.duration_ms,
            output: result.output.clone(),
        }
    }

    /// One-line reason, e.g. `self-test exited with status 1`.
    pub fn reason(&self) -> String {
        match &self.failure {
            Some(failure) => failure.to_string(),
            None => "self-test failed".to_string(),
        }
    }
}

/// Write `report` as `<reports_dir>/<YYYYmmdd-HHMMSS>-<seq>.json`.
pub fn write_report(reports_dir: &Path, report: &RejectionReport) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports dir {}", reports_dir.display()))?;
    let mut buf = serde_json::to_string_pretty(report).context("serialize rejection report")?;
    buf.push('\n');

    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    for seq in 0..MAX_REPORTS_PER_SECOND {
        let path = reports_dir.join(format!("{stamp}-{seq:03}.json"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(buf.as_bytes())
                    .with_context(|| format!("write {}", path.display()))?;
                return Ok(path);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err).with_context(|| format!("create {}", path.display())),
        }
    }
    Err(anyhow!(
        "more than {MAX_REPORTS_PER_SECOND} reports in second {stamp} under {}",
        reports_dir.display()
    ))
}

/// Render a report for the terminal.
pub fn render_report(report: &RejectionReport, saved_to: Option<&Path>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("rejection", REJECTION_TEMPLATE)
        .context("load rejection template")?;
    let template = env.get_template("rejection")?;
    let output = report.output.trim_end();
    let rendered = template.render(context! {
        report => report,
        reason => report.reason(),
        saved_to => saved_to.map(|path| path.display().to_string()),
        output => (!output.is_empty()).then_some(output),
    })?;
    Ok(rendered)
}

/// Event sink used by the CLI: persists and prints rejections, logs the rest.
#[derive(Debug, Clone)]
pub struct ReportSink {
    reports_dir: PathBuf,
}

impl ReportSink {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    fn publish(&self, report: &RejectionReport) {
        let saved_to = match write_report(&self.reports_dir, report) {
            Ok(path) => Some(path),
            Err(err) => {
                error!(err = %format!("{err:#}"), "failed to write rejection report");
                None
            }
        };
        match render_report(report, saved_to.as_deref()) {
            Ok(text) => eprint!("{text}"),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to render rejection report");
                eprintln!(
                    "candidate rejected ({}): {}\n{}",
                    report.provenance,
                    report.reason(),
                    report.output
                );
            }
        }
    }
}

impl EventSink for ReportSink {
    fn emit(&self, event: &SupervisorEvent) {
        match event {
            SupervisorEvent::Rejected(report) => {
                warn!(provenance = %report.provenance, reason = %report.reason(), "candidate rejected");
                self.publish(report);
            }
            SupervisorEvent::PhaseChanged { from, to } => {
                tracing::debug!(?from, ?to, "phase change");
            }
            SupervisorEvent::Unchanged { provenance } => {
                info!(provenance = %provenance, "candidate matches live payload, skipped");
            }
            SupervisorEvent::BackupCreated { id } => {
                info!(version = %id, "backup created");
            }
            SupervisorEvent::LiveReplaced { provenance } => {
                info!(provenance = %provenance, "candidate committed");
            }
            SupervisorEvent::Aborted { provenance, reason } => {
                error!(provenance = %provenance, reason = %reason, "upgrade attempt aborted");
            }
            SupervisorEvent::HandingOff { queued } => {
                info!(queued, "handing off to the new payload");
            }
            SupervisorEvent::RestartFailed { reason } => {
                error!(reason = %reason, "new payload is live but restart failed; restart manually");
            }
        }
    }
}
