//! Supervisor configuration stored in `supervisor.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "supervisor.toml";

/// Supervisor configuration (TOML).
///
/// Relative paths are resolved against the directory holding the config
/// file. Missing fields default to values matching a Python agent script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// The live payload file that upgrades replace.
    pub live_path: PathBuf,

    /// Holds `versions/`, `scratch/` and `reports/`.
    pub state_dir: PathBuf,

    pub validation: ValidationConfig,
    pub restart: RestartConfig,
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Command prefix used to launch a payload (e.g. `["python3"]`).
    /// Empty means the payload file is executed directly.
    pub launcher: Vec<String>,

    /// Hard wall-clock limit for the self-test child.
    pub timeout_secs: u64,

    /// Captured self-test output beyond this many bytes is discarded.
    pub output_limit_bytes: usize,
}

/// What gets exec'd once a new payload is live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestartTarget {
    /// Re-exec the supervisor binary with its original arguments.
    #[serde(rename = "self")]
    Current,
    /// Exec the payload itself through the launcher.
    Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestartConfig {
    pub target: RestartTarget,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourcesConfig {
    pub hub: HubConfig,
    pub export: ExportConfig,
}

/// Shared directory scanned for peer code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HubConfig {
    /// Directory to scan. Scanning is disabled when unset.
    pub dir: Option<PathBuf>,
    /// Regex matched against file names (not paths).
    pub pattern: String,
    pub interval_secs: u64,
    /// Files larger than this are skipped.
    pub max_file_bytes: u64,
}

/// Chat export scanned once at startup for code blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExportConfig {
    /// Export file. Scanning is disabled when unset.
    pub path: Option<PathBuf>,
    /// A blank-line separated chunk is a code block when it starts with one of these.
    pub block_prefixes: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            live_path: PathBuf::from("agent.py"),
            state_dir: PathBuf::from(".supervisor"),
            validation: ValidationConfig::default(),
            restart: RestartConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            launcher: vec!["python3".to_string()],
            timeout_secs: 20,
            output_limit_bytes: 64_000,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            target: RestartTarget::Current,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            dir: None,
            pattern: r"^agent.*\.py$".to_string(),
            interval_secs: 60,
            max_file_bytes: 1024 * 1024,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            path: None,
            block_prefixes: vec![
                "import ".to_string(),
                "from ".to_string(),
                "def ".to_string(),
                "class ".to_string(),
            ],
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.live_path.as_os_str().is_empty() {
            return Err(anyhow!("live_path must be non-empty"));
        }
        if self.live_path.file_name().is_none() {
            return Err(anyhow!("live_path must name a file"));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(anyhow!("state_dir must be non-empty"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        if self.validation.output_limit_bytes == 0 {
            return Err(anyhow!("validation.output_limit_bytes must be > 0"));
        }
        if self
            .validation
            .launcher
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("validation.launcher[0] must be non-empty"));
        }
        if self.sources.hub.interval_secs == 0 {
            return Err(anyhow!("sources.hub.interval_secs must be > 0"));
        }
        if self.sources.hub.max_file_bytes == 0 {
            return Err(anyhow!("sources.hub.max_file_bytes must be > 0"));
        }
        Regex::new(&self.sources.hub.pattern)
            .map_err(|err| anyhow!("sources.hub.pattern is not a valid regex: {err}"))?;
        if self
            .sources
            .export
            .block_prefixes
            .iter()
            .any(|prefix| prefix.trim().is_empty())
        {
            return Err(anyhow!("sources.export.block_prefixes must not contain blanks"));
        }
        Ok(())
    }

    /// Resolve relative paths against `base` (the config file's directory).
    pub fn resolved(mut self, base: &Path) -> Self {
        self.live_path = resolve(base, &self.live_path);
        self.state_dir = resolve(base, &self.state_dir);
        self.sources.hub.dir = self.sources.hub.dir.map(|dir| resolve(base, &dir));
        self.sources.export.path = self.sources.export.path.map(|path| resolve(base, &path));
        self
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
