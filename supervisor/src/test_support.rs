//! Test-only helpers: scripted seams and `sh`-based workspaces.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::candidate::CodeCandidate;
use crate::error::{UpgradeError, ValidationFailure};
use crate::io::config::{SupervisorConfig, ValidationConfig, load_config, write_config};
use crate::io::replace::{RestartOutcome, Restarter};
use crate::io::validator::{Outcome, ValidationResult, Validator};
use crate::supervisor::{EventSink, Phase, SupervisorEvent};

/// Payload that passes the self-test and prints `ready`.
pub fn ready_script(label: &str) -> String {
    format!(
        "# {label}\nif [ \"$1\" = \"--self-test\" ]; then echo ready; exit 0; fi\necho running {label}\n"
    )
}

/// Payload that fails its self-test with an error on stderr.
pub fn crashing_script(message: &str) -> String {
    format!("echo \"Traceback: {message}\" >&2\nexit 1\n")
}

/// Payload that ignores the self-test flag and spins forever, after writing
/// its pid to `pid_file`.
pub fn hanging_script(pid_file: &Path) -> String {
    format!(
        "echo $$ > '{}'\nwhile true; do :; done\n",
        pid_file.display()
    )
}

/// Temp directory with a live `sh` payload and a config that launches
/// payloads with `sh`.
pub struct ShellWorkspace {
    dir: tempfile::TempDir,
    pub config_path: PathBuf,
    pub live_path: PathBuf,
}

impl ShellWorkspace {
    pub fn new(live_payload: &str) -> Self {
        Self::with_timeout(live_payload, 10)
    }

    pub fn with_timeout(live_payload: &str, timeout_secs: u64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let live_path = dir.path().join("agent.sh");
        fs::write(&live_path, live_payload).expect("write live payload");
        let config = SupervisorConfig {
            live_path: PathBuf::from("agent.sh"),
            validation: ValidationConfig {
                launcher: vec!["sh".to_string()],
                timeout_secs,
                ..ValidationConfig::default()
            },
            ..SupervisorConfig::default()
        };
        let config_path = dir.path().join("supervisor.toml");
        write_config(&config_path, &config).expect("write config");
        Self {
            dir,
            config_path,
            live_path,
        }
    }

    /// Edit the workspace config in place.
    pub fn configure(&self, edit: impl FnOnce(&mut SupervisorConfig)) {
        let mut config = load_config(&self.config_path).expect("load config");
        edit(&mut config);
        write_config(&self.config_path, &config).expect("write config");
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn live(&self) -> String {
        fs::read_to_string(&self.live_path).expect("read live payload")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path(".supervisor")
    }

    /// Names of files in `<state_dir>/<sub>`, sorted.
    pub fn state_files(&self, sub: &str) -> Vec<String> {
        let dir = self.state_dir().join(sub);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Validator returning a fixed result and counting calls.
#[derive(Debug, Clone)]
pub struct ScriptedValidator {
    result: ValidationResult,
    calls: Arc<AtomicUsize>,
}

impl ScriptedValidator {
    pub fn always(outcome: Outcome) -> Self {
        let failure = match outcome {
            Outcome::Pass => None,
            Outcome::Fail => Some(ValidationFailure::NonZeroExit { code: 1 }),
        };
        Self::new(ValidationResult {
            outcome,
            output: String::new(),
            duration_ms: 1,
            failure,
        })
    }

    pub fn failing(failure: ValidationFailure, output: &str) -> Self {
        Self::new(ValidationResult {
            outcome: Outcome::Fail,
            output: output.to_string(),
            duration_ms: 1,
            failure: Some(failure),
        })
    }

    fn new(result: ValidationResult) -> Self {
        Self {
            result,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, _candidate: &CodeCandidate) -> ValidationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

#[derive(Debug, Clone)]
enum RestartBehavior {
    HandOff,
    Disabled,
    Fail(String),
}

/// Restarter that records calls instead of replacing the process.
#[derive(Debug, Clone)]
pub struct RecordingRestarter {
    behavior: RestartBehavior,
    calls: Arc<AtomicUsize>,
}

impl RecordingRestarter {
    pub fn succeeding() -> Self {
        Self::with(RestartBehavior::HandOff)
    }

    pub fn disabled() -> Self {
        Self::with(RestartBehavior::Disabled)
    }

    pub fn failing(detail: &str) -> Self {
        Self::with(RestartBehavior::Fail(detail.to_string()))
    }

    fn with(behavior: RestartBehavior) -> Self {
        Self {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Restarter for RecordingRestarter {
    fn restart(&self) -> Result<RestartOutcome, UpgradeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            RestartBehavior::HandOff => Ok(RestartOutcome::HandedOff),
            RestartBehavior::Disabled => Ok(RestartOutcome::NotRequested),
            RestartBehavior::Fail(detail) => Err(UpgradeError::RestartFailure {
                detail: detail.clone(),
            }),
        }
    }
}

/// Sink that keeps every event, optionally with a snapshot of the live file
/// taken at the moment the event fired.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    watched: Option<PathBuf>,
    events: Arc<Mutex<Vec<(SupervisorEvent, String)>>>,
}

impl RecordingSink {
    pub fn watching(live_path: &Path) -> Self {
        Self {
            watched: Some(live_path.to_path_buf()),
            events: Arc::default(),
        }
    }

    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.live_at_events()
            .into_iter()
            .map(|(event, _)| event)
            .collect()
    }

    pub fn live_at_events(&self) -> Vec<(SupervisorEvent, String)> {
        self.events.lock().expect("events lock").clone()
    }

    /// Target phase of every phase change, in order.
    pub fn phases(&self) -> Vec<Phase> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SupervisorEvent::PhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &SupervisorEvent) {
        let live = self
            .watched
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .unwrap_or_default();
        self.events
            .lock()
            .expect("events lock")
            .push((event.clone(), live));
    }
}
