//! Command-line contract of the external archive tool.
//!
//! Everything that knows how `borg` is spelled lives here: argument order, the
//! environment it needs, and the JSON it prints.

use std::path::Path;

use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::error::Result;
use crate::identity::SshIdentity;
use crate::profile::CompressionPlan;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::sanitize::Redactor;

pub const DEFAULT_PROGRAM: &str = "borg";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    Repokey,
    None,
}

impl EncryptionMode {
    pub fn for_passphrase(passphrase: Option<&str>) -> Self {
        match passphrase {
            Some(p) if !p.is_empty() => EncryptionMode::Repokey,
            _ => EncryptionMode::None,
        }
    }

    /// Value for `borg init --encryption`.
    pub fn init_arg(self) -> &'static str {
        match self {
            EncryptionMode::Repokey => "repokey-blake2",
            EncryptionMode::None => "none",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionMode::Repokey => "repokey",
            EncryptionMode::None => "none",
        }
    }
}

/// Builds borg invocations for one repository.
#[derive(Debug, Clone)]
pub struct BorgCli {
    program: String,
    location: String,
    env: Vec<(String, String)>,
    env_remove: Vec<String>,
    debug: bool,
    passphrase: Option<String>,
    /// Masked in logs and error details along with the passphrase.
    secrets: Vec<String>,
}

impl BorgCli {
    pub fn new(config: &RunConfig, identity: &SshIdentity) -> Self {
        let mut rsh = format!(
            "ssh -o UserKnownHostsFile={} -o StrictHostKeyChecking=accept-new -i {}",
            config.paths.known_hosts.display(),
            identity.private_key.display()
        );
        if let Some(extra) = config.ssh_params.as_deref() {
            rsh.push(' ');
            rsh.push_str(extra);
        }

        let mut env = vec![
            (
                "BORG_BASE_DIR".to_string(),
                config.paths.base_dir.display().to_string(),
            ),
            (
                "BORG_CACHE_DIR".to_string(),
                config.paths.cache_dir.display().to_string(),
            ),
            ("BORG_RSH".to_string(), rsh),
        ];
        let mut env_remove = Vec::new();
        match config.passphrase.as_deref() {
            Some(p) => {
                env.push(("BORG_PASSPHRASE".into(), p.to_string()));
                env_remove.push("BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK".into());
            }
            None => {
                env.push(("BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK".into(), "yes".into()));
                env_remove.push("BORG_PASSPHRASE".into());
            }
        }

        Self {
            program: DEFAULT_PROGRAM.into(),
            location: config.repo.location(),
            env,
            env_remove,
            debug: config.debug,
            passphrase: config.passphrase.clone(),
            secrets: Vec::new(),
        }
    }

    pub fn with_secrets<I: IntoIterator<Item = String>>(mut self, secrets: I) -> Self {
        self.secrets.extend(secrets);
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }

    pub fn redactor(&self) -> Redactor {
        Redactor::new(self.passphrase.iter().chain(&self.secrets).cloned())
    }

    pub fn archive_ref(&self, name: &str) -> String {
        format!("{}::{name}", self.location)
    }

    fn base(&self, subcommand: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(self.program.clone()).arg(subcommand);
        for k in &self.env_remove {
            spec = spec.env_remove(k.clone());
        }
        for (k, v) in &self.env {
            spec = spec.env(k.clone(), v.clone());
        }
        if self.debug {
            spec = spec.arg("--debug");
        }
        spec
    }

    /// Probe and stats in one call. `--log-json` makes failures carry a msgid.
    pub fn info(&self) -> CommandSpec {
        self.base("info")
            .args(["--json", "--log-json"])
            .arg(self.location.clone())
            .capture_stdout()
    }

    pub fn init(&self, mode: EncryptionMode) -> CommandSpec {
        self.base("init")
            .arg(format!("--encryption={}", mode.init_arg()))
            .arg(self.location.clone())
    }

    pub fn check_repair(&self) -> CommandSpec {
        self.base("check")
            .arg("--repair")
            .arg(self.location.clone())
            .env("BORG_CHECK_I_KNOW_WHAT_I_AM_DOING", "YES")
    }

    pub fn create<P: AsRef<Path>>(
        &self,
        archive: &str,
        plan: &CompressionPlan,
        excludes: &[String],
        sources: &[P],
    ) -> CommandSpec {
        let mut spec = self
            .base("create")
            .arg("--compression")
            .arg(plan.compression_spec());
        if let Some(cp) = plan.chunker_params.as_deref() {
            spec = spec.arg("--chunker-params").arg(cp);
        }
        spec = spec.args(["--stats", "--json", "--progress", "--log-json"]);
        for pattern in excludes {
            spec = spec.arg("--exclude").arg(pattern.clone());
        }
        spec = spec.arg(self.archive_ref(archive));
        for s in sources {
            spec = spec.arg(s.as_ref().display().to_string());
        }
        spec.capture_stdout()
    }

    pub fn list_json(&self) -> CommandSpec {
        self.base("list")
            .arg("--json")
            .arg(self.location.clone())
            .capture_stdout()
    }

    pub fn delete(&self, archive: &str) -> CommandSpec {
        self.base("delete").arg(self.archive_ref(archive))
    }

    pub fn compact(&self) -> CommandSpec {
        self.base("compact").arg(self.location.clone())
    }

    /// borg extracts into the current directory.
    pub fn extract(&self, archive: &str, into: &Path) -> CommandSpec {
        self.base("extract")
            .args(["--progress", "--log-json"])
            .arg(self.archive_ref(archive))
            .cwd(into)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArchiveStats {
    pub original_size: u64,
    pub compressed_size: u64,
    pub deduplicated_size: u64,
    pub nfiles: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListedArchive {
    pub name: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub stats: Option<ArchiveStats>,
}

impl ListedArchive {
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        self.time
            .as_deref()
            .or(self.start.as_deref())
            .and_then(parse_time)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListOutput {
    pub archives: Vec<ListedArchive>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedArchive {
    pub name: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub stats: ArchiveStats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOutput {
    pub archive: CreatedArchive,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheStats {
    pub total_size: u64,
    pub total_csize: u64,
    pub unique_csize: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheInfo {
    pub stats: CacheStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepositoryInfo {
    pub id: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncryptionInfo {
    pub mode: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InfoOutput {
    pub cache: CacheInfo,
    pub repository: RepositoryInfo,
    pub encryption: EncryptionInfo,
    pub archives: Vec<serde_json::Value>,
}

/// One `--log-json` line on stderr.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogLine {
    ArchiveProgress {
        #[serde(default)]
        original_size: u64,
        #[serde(default)]
        nfiles: u64,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        finished: bool,
    },
    ProgressPercent {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        current: Option<u64>,
        #[serde(default)]
        total: Option<u64>,
        #[serde(default)]
        finished: bool,
    },
    ProgressMessage {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        finished: bool,
    },
    LogMessage {
        #[serde(default)]
        levelname: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        msgid: Option<String>,
    },
    FileStatus {
        #[serde(default)]
        status: String,
        #[serde(default)]
        path: String,
    },
    #[serde(other)]
    Other,
}

pub fn parse_log_line(line: &str) -> Option<LogLine> {
    let t = line.trim_start();
    if !t.starts_with('{') {
        return None;
    }
    serde_json::from_str(t).ok()
}

/// Run one borg command, logging its stderr. Parsed `--log-json` records are also
/// handed to `on_record`.
pub fn run_borg(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    redactor: &Redactor,
    on_record: &mut dyn FnMut(&LogLine),
) -> Result<CommandOutput> {
    debug!(command = %spec, "borg");
    runner.run(spec, &mut |stream, line| match parse_log_line(line) {
        Some(record) => {
            log_record(&record, redactor);
            on_record(&record);
        }
        None => debug!(target: "borg", ?stream, "{}", redactor.clean(line)),
    })
}

fn log_record(record: &LogLine, redactor: &Redactor) {
    let LogLine::LogMessage {
        levelname, message, ..
    } = record
    else {
        return;
    };
    let message = redactor.clean(message);
    match levelname.as_str() {
        "ERROR" | "CRITICAL" => error!(target: "borg", "{message}"),
        "WARNING" => warn!(target: "borg", "{message}"),
        "INFO" => info!(target: "borg", "{message}"),
        _ => debug!(target: "borg", "{message}"),
    }
}

/// Human-readable reason for a failed borg call: the logged messages when `--log-json`
/// was used, else the raw stderr. Covers the whole tail the runner kept.
pub fn failure_message(out: &CommandOutput, redactor: &Redactor) -> String {
    let lines: Vec<String> = out
        .stderr_tail
        .iter()
        .filter_map(|l| match parse_log_line(l) {
            Some(LogLine::LogMessage {
                levelname, message, ..
            }) if matches!(levelname.as_str(), "ERROR" | "CRITICAL" | "WARNING") => Some(message),
            Some(_) => None,
            None => Some(l.clone()),
        })
        .map(|l| redactor.clean(&l))
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return match out.code {
            Some(c) => format!("borg exited with status {c}"),
            None => "borg terminated by signal".into(),
        };
    }
    lines.join("\n")
}

pub fn parse_time(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}
