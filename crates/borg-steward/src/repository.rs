//! Repository lifecycle: probe, first-time initialization, single repair pass.

use tracing::{info, warn};

use crate::borg::{
    BorgCli, EncryptionMode, InfoOutput, ListOutput, LogLine, failure_message, parse_log_line,
    run_borg,
};
use crate::config::{RunConfig, SecurityWarning};
use crate::error::{Error, RepositoryErrorKind, Result};
use crate::identity::SshIdentity;
use crate::runner::{CommandOutput, CommandRunner};
use crate::status::{Entities, Phase, StatusEvent, StatusPublisher, publish_best_effort};

const AUTH_MSGIDS: &[&str] = &["PassphraseWrong", "PasswordRetriesExceeded", "NoPassphraseFailure"];
const AUTH_MARKERS: &[&str] = &[
    "passphrase",
    "authentication",
    "permission denied (publickey",
    "host key verification failed",
];

const CORRUPT_MSGIDS: &[&str] = &[
    "IntegrityError",
    "Repository.CheckNeeded",
    "Repository.ObjectNotFound",
];
const CORRUPT_MARKERS: &[&str] = &[
    "integrity error",
    "integrityerror",
    "checksum mismatch",
    "data integrity",
    "corrupted",
    "index mismatch",
    "inconsistency detected",
    "check needed",
];

const MISSING_MSGIDS: &[&str] = &["Repository.DoesNotExist", "Repository.InvalidRepository"];
const MISSING_MARKERS: &[&str] = &["does not exist", "is not a valid repository"];

const CONN_MSGIDS: &[&str] = &["ConnectionClosed", "ConnectionClosedWithHint"];
const CONN_MARKERS: &[&str] = &[
    "connection closed",
    "connection refused",
    "connection reset",
    "could not resolve",
    "timed out",
    "no route to host",
    "network is unreachable",
];

/// Outcome of one `borg info` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Initialized,
    Uninitialized,
    Unreachable,
    Corrupted,
    AuthFailed,
}

/// Classify a failed or successful probe from its exit code and stderr.
pub fn classify_probe(out: &CommandOutput) -> ProbeState {
    if out.success() {
        return ProbeState::Initialized;
    }

    let mut msgids: Vec<String> = Vec::new();
    let mut text = String::new();
    for line in &out.stderr_tail {
        match parse_log_line(line) {
            Some(LogLine::LogMessage { message, msgid, .. }) => {
                msgids.extend(msgid);
                text.push_str(&message.to_lowercase());
            }
            Some(_) => continue,
            None => text.push_str(&line.to_lowercase()),
        }
        text.push('\n');
    }

    let has = |ids: &[&str], markers: &[&str]| {
        msgids.iter().any(|m| ids.contains(&m.as_str()))
            || markers.iter().any(|m| text.contains(m))
    };

    if has(AUTH_MSGIDS, AUTH_MARKERS) {
        ProbeState::AuthFailed
    } else if has(CORRUPT_MSGIDS, CORRUPT_MARKERS) {
        ProbeState::Corrupted
    } else if has(MISSING_MSGIDS, MISSING_MARKERS) {
        ProbeState::Uninitialized
    } else if has(CONN_MSGIDS, CONN_MARKERS) {
        ProbeState::Unreachable
    } else if out.code == Some(2) {
        ProbeState::Uninitialized
    } else {
        ProbeState::Unreachable
    }
}

/// An opened repository, valid for one run.
#[derive(Debug, Clone)]
pub struct RepositoryHandle {
    pub borg: BorgCli,
    pub encryption: EncryptionMode,
    pub initialized_now: bool,
    pub repaired: bool,
    pub warnings: Vec<SecurityWarning>,
}

impl RepositoryHandle {
    pub fn location(&self) -> &str {
        self.borg.location()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryStats {
    pub size_gb: f64,
    pub archives: usize,
    pub last_modified: Option<String>,
    pub compression_ratio: Option<f64>,
    pub encryption: String,
}

struct Probe {
    state: ProbeState,
    detail: String,
    info: InfoOutput,
}

pub struct RepositoryManager<'a> {
    runner: &'a dyn CommandRunner,
    status: Option<(&'a dyn StatusPublisher, &'a Entities)>,
    secrets: Vec<String>,
}

impl<'a> RepositoryManager<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            status: None,
            secrets: Vec::new(),
        }
    }

    /// Values redacted from borg output besides the passphrase, e.g. API tokens.
    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Announce the repair pass on the status entity.
    pub fn with_status(mut self, publisher: &'a dyn StatusPublisher, entities: &'a Entities) -> Self {
        self.status = Some((publisher, entities));
        self
    }

    /// Open the configured repository, creating it on first use and repairing it once if
    /// the probe reports corruption.
    pub fn resolve(&self, config: &RunConfig, identity: &SshIdentity) -> Result<RepositoryHandle> {
        let borg = BorgCli::new(config, identity).with_secrets(self.secrets.iter().cloned());
        info!(repository = borg.location(), "probing repository");
        let probe = self.probe(&borg)?;

        match probe.state {
            ProbeState::Initialized => opened(borg, &probe.info),
            ProbeState::Uninitialized => self.initialize(borg),
            ProbeState::Corrupted => self.repair(borg, probe.detail),
            state => Err(probe_error(state, probe.detail)),
        }
    }

    fn probe(&self, borg: &BorgCli) -> Result<Probe> {
        let redactor = borg.redactor();
        let out = run_borg(self.runner, &borg.info(), &redactor, &mut |_| {})?;
        let state = classify_probe(&out);
        let info = if out.success() && !out.stdout.trim().is_empty() {
            serde_json::from_str(&out.stdout).unwrap_or_else(|e| {
                warn!(error = %e, "unparseable borg info output");
                InfoOutput::default()
            })
        } else {
            InfoOutput::default()
        };
        let detail = if out.success() {
            String::new()
        } else {
            failure_message(&out, &redactor)
        };
        Ok(Probe {
            state,
            detail,
            info,
        })
    }

    fn initialize(&self, borg: BorgCli) -> Result<RepositoryHandle> {
        let mode = EncryptionMode::for_passphrase(borg.passphrase());
        info!(
            repository = borg.location(),
            encryption = mode.as_str(),
            "initializing new repository"
        );
        let redactor = borg.redactor();
        let out = run_borg(self.runner, &borg.init(mode), &redactor, &mut |_| {})?;
        if !out.success() {
            return Err(Error::repository(
                RepositoryErrorKind::Tool,
                format!("borg init failed: {}", failure_message(&out, &redactor)),
            ));
        }

        let mut warnings = Vec::new();
        if mode == EncryptionMode::None {
            warn!("repository initialized WITHOUT encryption");
            warnings.push(SecurityWarning {
                code: "unencrypted_init",
                message: format!(
                    "Repository {} was initialized without encryption.",
                    borg.location()
                ),
            });
        }
        Ok(RepositoryHandle {
            borg,
            encryption: mode,
            initialized_now: true,
            repaired: false,
            warnings,
        })
    }

    fn repair(&self, borg: BorgCli, detail: String) -> Result<RepositoryHandle> {
        warn!(reason = %detail, "repository looks corrupted, running one repair pass");
        if let Some((publisher, entities)) = self.status {
            publish_best_effort(
                publisher,
                &StatusEvent::phase(entities, Phase::Repairing).attr("reason", detail.clone()),
            );
        }
        let redactor = borg.redactor();
        let out = run_borg(self.runner, &borg.check_repair(), &redactor, &mut |_| {})?;
        if !out.success() {
            warn!(
                reason = %failure_message(&out, &redactor),
                "borg check --repair reported failure"
            );
        }

        let probe = self.probe(&borg)?;
        match probe.state {
            ProbeState::Initialized => {
                info!("repository repaired");
                let mut handle = opened(borg, &probe.info)?;
                handle.repaired = true;
                Ok(handle)
            }
            ProbeState::Corrupted => Err(Error::repository(
                RepositoryErrorKind::Corrupted,
                format!("still corrupted after repair: {}", probe.detail),
            )),
            state => Err(probe_error(state, probe.detail)),
        }
    }

    /// Size, archive count and compression ratio. Best-effort; callers log failures.
    pub fn repository_info(&self, handle: &RepositoryHandle) -> Result<RepositoryStats> {
        let redactor = handle.borg.redactor();
        let out = run_borg(self.runner, &handle.borg.info(), &redactor, &mut |_| {})?;
        if !out.success() {
            return Err(Error::execution(format!(
                "borg info failed: {}",
                failure_message(&out, &redactor)
            )));
        }
        let info: InfoOutput = serde_json::from_str(&out.stdout)?;

        let list = run_borg(self.runner, &handle.borg.list_json(), &redactor, &mut |_| {})?;
        let archives = if list.success() {
            serde_json::from_str::<ListOutput>(&list.stdout)
                .map(|l| l.archives.len())
                .unwrap_or_default()
        } else {
            0
        };

        let stats = &info.cache.stats;
        let compression_ratio = (stats.total_csize > 0)
            .then(|| round2(stats.total_size as f64 / stats.total_csize as f64));
        Ok(RepositoryStats {
            size_gb: round2(stats.unique_csize as f64 / (1024.0 * 1024.0 * 1024.0)),
            archives,
            last_modified: info.repository.last_modified.clone(),
            compression_ratio,
            encryption: handle.encryption.as_str().to_string(),
        })
    }
}

/// The handle for a repository that answered the probe. The configured passphrase must
/// agree with the mode the repository was created with.
fn opened(borg: BorgCli, info: &InfoOutput) -> Result<RepositoryHandle> {
    let configured = EncryptionMode::for_passphrase(borg.passphrase());
    let mode = info.encryption.mode.as_str();
    let encryption = match mode {
        "" => configured,
        m if m == "none" || m.starts_with("authenticated") => EncryptionMode::None,
        _ => EncryptionMode::Repokey,
    };
    // Authenticated repositories are unencrypted but still keyed by a passphrase.
    let keyed = match mode {
        "" => configured == EncryptionMode::Repokey,
        m => m != "none",
    };
    if keyed != (configured == EncryptionMode::Repokey) {
        let detail = if keyed {
            "is protected by a passphrase but none is configured"
        } else {
            "is not encrypted but a passphrase is configured"
        };
        return Err(Error::repository(
            RepositoryErrorKind::AuthFailed,
            format!(
                "repository {} {detail}; its encryption is fixed at creation",
                borg.location()
            ),
        ));
    }
    info!(
        repository = borg.location(),
        encryption = encryption.as_str(),
        "repository ready"
    );
    Ok(RepositoryHandle {
        borg,
        encryption,
        initialized_now: false,
        repaired: false,
        warnings: Vec::new(),
    })
}

fn probe_error(state: ProbeState, detail: String) -> Error {
    let kind = match state {
        ProbeState::AuthFailed => RepositoryErrorKind::AuthFailed,
        ProbeState::Corrupted => RepositoryErrorKind::Corrupted,
        ProbeState::Unreachable => RepositoryErrorKind::Unreachable,
        ProbeState::Initialized | ProbeState::Uninitialized => RepositoryErrorKind::Tool,
    };
    Error::repository(kind, detail)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
