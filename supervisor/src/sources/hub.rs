//! Periodic scan of a shared directory for peer code.
//!
//! A scan lists the directory once (no recursion), so its cost is bounded by
//! the number of entries. Files already offered by this scanner are not
//! offered again unless their contents change.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use super::{CandidateFunnel, OfferError, RawCandidate};
use crate::candidate::payload_digest;
use crate::io::config::HubConfig;

#[derive(Debug)]
pub struct HubScanner {
    dir: PathBuf,
    pattern: Regex,
    max_file_bytes: u64,
    seen: HashSet<String>,
}

impl HubScanner {
    pub fn new(dir: impl Into<PathBuf>, pattern: &str, max_file_bytes: u64) -> Result<Self> {
        let pattern =
            Regex::new(pattern).with_context(|| format!("compile hub pattern '{pattern}'"))?;
        Ok(Self {
            dir: dir.into(),
            pattern,
            max_file_bytes,
            seen: HashSet::new(),
        })
    }

    /// Build from config. `None` when no hub directory is configured.
    pub fn from_config(cfg: &HubConfig) -> Result<Option<Self>> {
        cfg.dir
            .as_ref()
            .map(|dir| Self::new(dir.clone(), &cfg.pattern, cfg.max_file_bytes))
            .transpose()
    }

    /// Remember `digest` as already offered (e.g. the live payload).
    pub fn mark_seen(&mut self, digest: String) {
        self.seen.insert(digest);
    }

    /// New matching files, sorted by name. Unreadable or oversized entries
    /// are skipped with a warning.
    pub fn scan(&mut self) -> Result<Vec<RawCandidate>> {
        let entries =
            fs::read_dir(&self.dir).with_context(|| format!("read hub {}", self.dir.display()))?;
        let mut matches = Vec::new();
        for entry in entries {
            let entry = entry.context("read hub entry")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.pattern.is_match(&name) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(file = %name, err = %err, "cannot stat hub file");
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            if meta.len() > self.max_file_bytes {
                warn!(file = %name, bytes = meta.len(), limit = self.max_file_bytes, "hub file too large, skipped");
                continue;
            }
            matches.push((name, entry.path()));
        }
        matches.sort();

        let mut found = Vec::new();
        for (name, path) in matches {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(file = %name, err = %err, "cannot read hub file");
                    continue;
                }
            };
            if !self.seen.insert(payload_digest(&bytes)) {
                debug!(file = %name, "hub file already offered");
                continue;
            }
            found.push(RawCandidate::new(bytes, format!("hub:{name}")));
        }
        debug!(dir = %self.dir.display(), new = found.len(), "hub scan complete");
        Ok(found)
    }
}

/// Scan every `interval` on a background thread until `stop` fires or is
/// dropped, or the funnel closes.
pub fn spawn_hub_scanner(
    mut scanner: HubScanner,
    interval: Duration,
    funnel: CandidateFunnel,
    stop: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!(dir = %scanner.dir.display(), interval_secs = interval.as_secs(), "hub scanner started");
        loop {
            match scanner.scan() {
                Ok(found) => {
                    for raw in found {
                        if funnel.offer(raw) == Err(OfferError::Closed) {
                            return;
                        }
                    }
                }
                Err(err) => warn!(err = %format!("{err:#}"), "hub scan failed"),
            }
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("hub scanner stopped");
    })
}
