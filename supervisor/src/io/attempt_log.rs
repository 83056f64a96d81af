//! Append-only log of judged candidates (`<state_dir>/attempts.jsonl`).
//!
//! Survives restarts, so automatic sources do not offer the new process a
//! payload the previous one already validated.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::candidate::CodeCandidate;
use crate::io::validator::Outcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub digest: String,
    pub provenance: String,
    pub outcome: Outcome,
    pub judged_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptLog {
    path: PathBuf,
}

impl AttemptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line for `candidate` and flush it to disk.
    pub fn record(&self, candidate: &CodeCandidate, outcome: Outcome) -> Result<()> {
        let entry = AttemptEntry {
            digest: candidate.digest(),
            provenance: candidate.provenance().to_string(),
            outcome,
            judged_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry).context("serialize attempt entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open attempt log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append attempt log {}", self.path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync attempt log {}", self.path.display()))?;
        Ok(())
    }

    /// Every entry, oldest first. A missing log is empty; unparseable lines
    /// (e.g. a torn final write) are skipped.
    pub fn entries(&self) -> Result<Vec<AttemptEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read attempt log {}", self.path.display()));
            }
        };
        let mut entries = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(line = n + 1, err = %err, "skipping bad attempt log line"),
            }
        }
        Ok(entries)
    }

    pub fn digests(&self) -> Result<HashSet<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|entry| entry.digest)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(payload: &str, provenance: &str) -> CodeCandidate {
        CodeCandidate::new(payload, provenance).expect("candidate")
    }

    #[test]
    fn missing_log_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AttemptLog::new(temp.path().join("attempts.jsonl"));
        assert!(log.entries().expect("entries").is_empty());
    }

    #[test]
    fn records_accumulate_across_handles() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("attempts.jsonl");
        let a = candidate("echo a\n", "hub:agent_a.sh");
        let b = candidate("echo b\n", "hub:agent_b.sh");

        AttemptLog::new(&path).record(&a, Outcome::Pass).expect("record a");
        AttemptLog::new(&path).record(&b, Outcome::Fail).expect("record b");

        let entries = AttemptLog::new(&path).entries().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].provenance, "hub:agent_a.sh");
        assert_eq!(entries[0].outcome, Outcome::Pass);
        assert_eq!(entries[1].outcome, Outcome::Fail);
        let digests = AttemptLog::new(&path).digests().expect("digests");
        assert!(digests.contains(&a.digest()));
        assert!(digests.contains(&b.digest()));
    }

    #[test]
    fn torn_line_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AttemptLog::new(temp.path().join("attempts.jsonl"));
        log.record(&candidate("echo a\n", "paste"), Outcome::Pass)
            .expect("record");
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.path())
            .expect("open");
        file.write_all(b"{\"digest\":\"ab").expect("write torn line");

        assert_eq!(log.entries().expect("entries").len(), 1);
    }
}
