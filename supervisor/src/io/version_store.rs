//! Append-only archive of previously live payloads.
//!
//! Each version is a standalone file named `<YYYYmmdd-HHMMSS>-<seq>-<live name>`
//! so a lexicographic sort of the directory is chronological. `seq` starts at
//! `000` and disambiguates backups taken within the same second.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::error::{StartupError, UpgradeError};

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const MAX_SEQ_PER_SECOND: u32 = 1000;

static VERSION_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<stamp>\d{8}-\d{6})-(?P<seq>\d{3})-").expect("version file regex is valid")
});
static VERSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}-\d{6}-\d{3}$").expect("version id regex is valid"));

/// One archived payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    /// `<stamp>-<seq>`, sortable.
    pub id: String,
    pub payload: String,
    pub stored_at: DateTime<Utc>,
}

/// Directory-backed version archive.
#[derive(Debug, Clone)]
pub struct VersionStore {
    dir: PathBuf,
    /// File name of the live payload, appended to every archived file name.
    live_name: String,
}

impl VersionStore {
    /// Open (creating if needed) the archive directory.
    pub fn open(dir: impl Into<PathBuf>, live_path: &Path) -> Result<Self, StartupError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StartupError {
            path: dir.clone(),
            source,
        })?;
        let live_name = live_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_string());
        Ok(Self { dir, live_name })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive `payload` (the presently live payload) under a fresh id.
    pub fn backup(&self, payload: &str) -> Result<VersionRecord, UpgradeError> {
        self.backup_at(payload, Utc::now())
    }

    /// Archive `payload` as if taken at `now`.
    ///
    /// The payload is fully written and synced to a hidden temp file first,
    /// then linked into place without clobbering, so a reader never sees a
    /// partial version and two backups in the same second never collide.
    #[instrument(skip_all, fields(dir = %self.dir.display(), bytes = payload.len()))]
    pub fn backup_at(
        &self,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<VersionRecord, UpgradeError> {
        let backup_err = |path: &Path, source: io::Error| UpgradeError::BackupIo {
            path: path.to_path_buf(),
            source,
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".backup-")
            .tempfile_in(&self.dir)
            .map_err(|err| backup_err(&self.dir, err))?;
        tmp.write_all(payload.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|err| backup_err(tmp.path(), err))?;

        let stamp = now.format(STAMP_FORMAT).to_string();
        let stored_at = parse_stamp(&stamp).unwrap_or(now);
        for seq in 0..MAX_SEQ_PER_SECOND {
            let id = format!("{stamp}-{seq:03}");
            let path = self.path_for(&id);
            match tmp.persist_noclobber(&path) {
                Ok(_) => {
                    sync_dir(&self.dir);
                    info!(id = %id, path = %path.display(), "archived live payload");
                    return Ok(VersionRecord {
                        id,
                        payload: payload.to_string(),
                        stored_at,
                    });
                }
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(id = %id, "version id taken, trying next sequence");
                    tmp = err.file;
                }
                Err(err) => return Err(backup_err(&path, err.error)),
            }
        }
        Err(backup_err(
            &self.dir,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("more than {MAX_SEQ_PER_SECOND} backups in second {stamp}"),
            ),
        ))
    }

    /// All archived versions, oldest first.
    pub fn list(&self) -> Result<Vec<VersionRecord>> {
        let mut entries = Vec::new();
        for entry in
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?
        {
            let entry = entry.context("read version entry")?;
            if !entry.file_type().context("stat version entry")?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = parse_version_id(&name) {
                entries.push((name, id));
            }
        }
        entries.sort();

        entries
            .into_iter()
            .map(|(name, id)| self.load_record(&self.dir.join(name), id))
            .collect()
    }

    /// Load one version by id.
    pub fn get(&self, id: &str) -> Result<VersionRecord> {
        if !VERSION_ID_RE.is_match(id) {
            return Err(anyhow!(
                "malformed version id '{id}' (expected YYYYmmdd-HHMMSS-NNN)"
            ));
        }
        let path = self.path_for(id);
        if !path.is_file() {
            return Err(anyhow!(
                "unknown version '{id}' (no {} in {})",
                path.display(),
                self.dir.display()
            ));
        }
        self.load_record(&path, id.to_string())
    }

    fn load_record(&self, path: &Path, id: String) -> Result<VersionRecord> {
        let payload =
            fs::read_to_string(path).with_context(|| format!("read version {}", path.display()))?;
        let stored_at = parse_stamp(&id[..15])
            .ok_or_else(|| anyhow!("bad timestamp in version id '{id}'"))?;
        Ok(VersionRecord {
            id,
            payload,
            stored_at,
        })
    }

    fn file_name(&self, id: &str) -> String {
        format!("{id}-{}", self.live_name)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(self.file_name(id))
    }
}

fn parse_version_id(file_name: &str) -> Option<String> {
    let caps = VERSION_FILE_RE.captures(file_name)?;
    Some(format!("{}-{}", &caps["stamp"], &caps["seq"]))
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        tracing::warn!(err = %err, dir = %dir.display(), "failed to sync directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store(root: &Path) -> VersionStore {
        VersionStore::open(root.join("versions"), Path::new("/srv/agent.py")).expect("open")
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 19, 15, 44, secs)
            .single()
            .expect("valid time")
    }

    #[test]
    fn backup_writes_named_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());

        let record = store.backup_at("print('v1')\n", at(0)).expect("backup");

        assert_eq!(record.id, "20250719-154400-000");
        assert_eq!(record.stored_at, at(0));
        let path = store.dir().join("20250719-154400-000-agent.py");
        assert_eq!(fs::read_to_string(path).expect("read"), "print('v1')\n");
    }

    #[test]
    fn same_second_backups_do_not_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());

        let first = store.backup_at("one", at(5)).expect("first");
        let second = store.backup_at("two", at(5)).expect("second");
        let third = store.backup_at("three", at(5)).expect("third");

        assert_eq!(first.id, "20250719-154405-000");
        assert_eq!(second.id, "20250719-154405-001");
        assert_eq!(third.id, "20250719-154405-002");
        assert_eq!(store.get(&first.id).expect("get").payload, "one");
        assert_eq!(store.get(&second.id).expect("get").payload, "two");
    }

    #[test]
    fn list_is_chronological_and_skips_foreign_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.backup_at("late", at(30)).expect("late");
        store.backup_at("early", at(1)).expect("early");
        store.backup_at("early-again", at(1)).expect("early again");
        fs::write(store.dir().join("notes.txt"), "ignore me").expect("write foreign");

        let payloads: Vec<String> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|record| record.payload)
            .collect();
        assert_eq!(payloads, vec!["early", "early-again", "late"]);
    }

    #[test]
    fn backup_leaves_no_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.backup_at("x", at(2)).expect("backup");
        store.backup_at("y", at(2)).expect("backup");

        let names: Vec<String> = fs::read_dir(store.dir())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|name| !name.starts_with(".backup-")));
    }

    #[test]
    fn get_unknown_version_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = store(temp.path()).get("20990101-000000-000").unwrap_err();
        assert!(err.to_string().contains("unknown version"));
    }

    #[test]
    fn get_rejects_path_like_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = store(temp.path()).get("../../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("malformed version id"));
    }

    #[test]
    fn backup_into_missing_dir_is_backup_io() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::remove_dir(store.dir()).expect("remove versions dir");

        let err = store.backup("payload").unwrap_err();
        assert!(matches!(err, UpgradeError::BackupIo { .. }));
    }
}
