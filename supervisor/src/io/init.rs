//! State directory layout and `supervisor init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use super::config::{SupervisorConfig, write_config};
use crate::error::StartupError;

/// All canonical paths derived from a resolved config.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub live_path: PathBuf,
    pub state_dir: PathBuf,
    pub versions_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub attempts_path: PathBuf,
}

impl StatePaths {
    pub fn new(cfg: &SupervisorConfig) -> Self {
        let state_dir = cfg.state_dir.clone();
        Self {
            live_path: cfg.live_path.clone(),
            versions_dir: state_dir.join("versions"),
            scratch_dir: state_dir.join("scratch"),
            reports_dir: state_dir.join("reports"),
            attempts_path: state_dir.join("attempts.jsonl"),
            state_dir,
        }
    }

    /// Create every state directory and prove each one is writable.
    ///
    /// Any failure here is a [`StartupError`]: the supervisor cannot promise
    /// backups without a usable archive, so it refuses to start.
    pub fn ensure(&self) -> Result<(), StartupError> {
        for dir in [
            &self.state_dir,
            &self.versions_dir,
            &self.scratch_dir,
            &self.reports_dir,
        ] {
            ensure_writable_dir(dir)?;
        }
        Ok(())
    }
}

fn ensure_writable_dir(dir: &Path) -> Result<(), StartupError> {
    let fail = |source| StartupError {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(fail)?;
    tempfile::Builder::new()
        .prefix(".probe-")
        .tempfile_in(dir)
        .map_err(fail)?;
    Ok(())
}

/// Options for `init_state`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Write a default config at `config_path` and create the state directories.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_state(config_path: &Path, options: &InitOptions) -> Result<StatePaths> {
    if config_path.exists() && !options.force {
        return Err(anyhow!(
            "supervisor init: {} already exists (use --force to overwrite)",
            config_path.display()
        ));
    }
    let cfg = SupervisorConfig::default();
    write_config(config_path, &cfg)?;

    let base = config_base_dir(config_path);
    let paths = StatePaths::new(&cfg.resolved(&base));
    paths.ensure()?;
    Ok(paths)
}

/// Directory relative config paths are resolved against.
pub fn config_base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
