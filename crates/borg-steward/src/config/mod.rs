//! Run configuration: loading the add-on options document and validating it into an
//! immutable [`RunConfig`].
//!
//! Validation is pure. Environment overrides are passed in explicitly through
//! [`EnvOverlay`] so nothing here reads process state.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_base_dir() -> String {
    "/homeassistant/borg".into()
}

fn default_cache_dir() -> String {
    "/homeassistant/borg/cache".into()
}

fn default_staging_dir() -> String {
    "/backup/borg_unpacked".into()
}

fn default_known_hosts() -> String {
    "/homeassistant/borg/known_hosts".into()
}

fn default_ssh_key() -> String {
    "/homeassistant/borg/keys/borg_backup".into()
}

fn default_supervisor_backup_dir() -> String {
    "/backup".into()
}

fn default_restore_target() -> String {
    "/backup/borg_restored".into()
}

fn default_supervisor_url() -> String {
    "http://supervisor".into()
}

fn default_entity_prefix() -> String {
    "borg_backup".into()
}

fn default_backup_paths() -> Vec<String> {
    vec!["/config".into()]
}

/// Custom excludes arrive either as a list or as the add-on's comma-separated string.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExcludePatterns {
    List(Vec<String>),
    Csv(String),
}

impl ExcludePatterns {
    pub fn patterns(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            ExcludePatterns::List(v) => v.iter().map(String::as_str).collect(),
            ExcludePatterns::Csv(s) => s.split(',').collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathOptions {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_known_hosts")]
    pub known_hosts: String,
    #[serde(default = "default_ssh_key")]
    pub ssh_key: String,
    /// Where the supervisor keeps its snapshot tarballs.
    #[serde(default = "default_supervisor_backup_dir")]
    pub supervisor_backup_dir: String,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            cache_dir: default_cache_dir(),
            staging_dir: default_staging_dir(),
            known_hosts: default_known_hosts(),
            ssh_key: default_ssh_key(),
            supervisor_backup_dir: default_supervisor_backup_dir(),
        }
    }
}

/// The options document as written by the supervisor, before validation.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawOptions {
    pub borg_repo_url: Option<String>,
    pub borg_host: Option<String>,
    pub borg_user: Option<String>,
    pub borg_reponame: Option<String>,
    pub borg_ssh_params: Option<String>,
    pub borg_passphrase: Option<String>,
    pub borg_compression: Option<String>,
    pub borg_backup_keep_snapshots: Option<i64>,
    pub borg_exclude_logs: Option<bool>,
    pub borg_custom_excludes: Option<ExcludePatterns>,
    pub borg_backup_debug: Option<bool>,
    pub borg_backup_paths: Option<Vec<String>>,
    pub borg_retry_attempts: Option<u32>,
    pub borg_retry_backoff_secs: Option<u64>,
    pub restore_mode: Option<bool>,
    pub backup_name: Option<String>,
    pub backup_index: Option<i64>,
    pub restore_target: Option<String>,
    pub publish_entities: Option<bool>,
    pub supervisor_url: Option<String>,
    pub entity_prefix: Option<String>,
    /// Back up a fresh supervisor full snapshot instead of the raw source paths.
    pub supervisor_snapshot: Option<bool>,
    pub paths: PathOptions,
}

/// Read the options document. `.toml` files are parsed as TOML, anything else as JSON.
pub fn load(path: &Path) -> Result<RawOptions> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read options {}: {e}", path.display())))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&data)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))
    } else {
        serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("JSON parse error in {}: {e}", path.display())))
    }
}

/// Process-environment overrides, captured by the binary and applied explicitly.
#[derive(Debug, Clone, Default)]
pub struct EnvOverlay {
    pub restore_mode: Option<String>,
    pub backup_name: Option<String>,
    pub backup_index: Option<String>,
    pub publish_entities: Option<String>,
}

impl EnvOverlay {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut out = Self::default();
        for (k, v) in pairs {
            let slot = match k.as_ref() {
                "RESTORE_MODE" => &mut out.restore_mode,
                "BACKUP_NAME" => &mut out.backup_name,
                "BACKUP_INDEX" => &mut out.backup_index,
                "PUBLISH_ENTITIES" => &mut out.publish_entities,
                _ => continue,
            };
            *slot = Some(v.into());
        }
        out
    }

    pub fn apply(&self, raw: &mut RawOptions) -> Result<()> {
        if let Some(v) = non_empty(self.restore_mode.as_deref()) {
            raw.restore_mode = Some(v.eq_ignore_ascii_case("true"));
        }
        if let Some(v) = non_empty(self.backup_name.as_deref()) {
            raw.backup_name = Some(v.to_string());
        }
        if let Some(v) = non_empty(self.backup_index.as_deref()) {
            let idx = v
                .parse::<i64>()
                .map_err(|_| Error::config(format!("invalid BACKUP_INDEX '{v}'")))?;
            raw.backup_index = Some(idx);
        }
        if let Some(v) = non_empty(self.publish_entities.as_deref()) {
            raw.publish_entities = Some(v.eq_ignore_ascii_case("true"));
        }
        Ok(())
    }
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

fn non_empty_owned(v: Option<&String>) -> Option<String> {
    non_empty(v.map(String::as_str)).map(ToOwned::to_owned)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoAddress {
    Url(String),
    Remote {
        host: String,
        user: Option<String>,
        reponame: String,
    },
}

impl RepoAddress {
    /// Location string handed to borg.
    pub fn location(&self) -> String {
        match self {
            RepoAddress::Url(url) => url.clone(),
            RepoAddress::Remote {
                host,
                user,
                reponame,
            } => match user {
                Some(u) => format!("{u}@{host}:{reponame}"),
                None => format!("{host}:{reponame}"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd,
    Zlib,
    Lzma,
}

impl Compression {
    pub const VALID: [&'static str; 5] = ["none", "lz4", "zstd", "zlib", "lzma"];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Compression::None),
            "lz4" => Some(Compression::Lz4),
            "zstd" => Some(Compression::Zstd),
            "zlib" => Some(Compression::Zlib),
            "lzma" => Some(Compression::Lzma),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
            Compression::Zlib => "zlib",
            Compression::Lzma => "lzma",
        }
    }

    pub fn takes_level(self) -> bool {
        matches!(self, Compression::Zstd | Compression::Zlib | Compression::Lzma)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Backup,
    Restore,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Backup => "backup",
            RunMode::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSelection {
    Newest,
    Name(String),
    /// 1-based, newest first.
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based); doubles each time.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(10);
        self.initial_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReporterSettings {
    pub enabled: bool,
    pub base_url: String,
    pub entity_prefix: String,
    pub timeout: Duration,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_supervisor_url(),
            entity_prefix: default_entity_prefix(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    pub base_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub known_hosts: PathBuf,
    pub ssh_key: PathBuf,
    pub supervisor_backup_dir: PathBuf,
}

impl From<&PathOptions> for EnginePaths {
    fn from(p: &PathOptions) -> Self {
        Self {
            base_dir: PathBuf::from(&p.base_dir),
            cache_dir: PathBuf::from(&p.cache_dir),
            staging_dir: PathBuf::from(&p.staging_dir),
            known_hosts: PathBuf::from(&p.known_hosts),
            ssh_key: PathBuf::from(&p.ssh_key),
            supervisor_backup_dir: PathBuf::from(&p.supervisor_backup_dir),
        }
    }
}

/// Validated, immutable configuration for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub repo: RepoAddress,
    pub ssh_params: Option<String>,
    pub passphrase: Option<String>,
    pub compression: Compression,
    pub retention: u32,
    pub exclude_logs: bool,
    pub custom_excludes: Vec<String>,
    pub debug: bool,
    pub mode: RunMode,
    pub source_paths: Vec<PathBuf>,
    pub restore_selection: RestoreSelection,
    pub restore_target: PathBuf,
    pub supervisor_snapshot: bool,
    pub paths: EnginePaths,
    pub reporter: ReporterSettings,
    pub retry: RetryPolicy,
}

impl RunConfig {
    pub fn encrypted(&self) -> bool {
        self.passphrase.is_some()
    }
}

/// Non-fatal finding that must reach the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub config: RunConfig,
    pub warnings: Vec<SecurityWarning>,
}

fn resolve_address(raw: &RawOptions) -> Result<RepoAddress> {
    let url = non_empty_owned(raw.borg_repo_url.as_ref());
    let host = non_empty_owned(raw.borg_host.as_ref());
    let user = non_empty_owned(raw.borg_user.as_ref());
    let reponame = non_empty_owned(raw.borg_reponame.as_ref());
    let remote_given = host.is_some() || user.is_some() || reponame.is_some();

    match (url, remote_given) {
        (Some(_), true) => Err(Error::config(
            "cannot define both 'borg_repo_url' and 'borg_host'/'borg_user'/'borg_reponame'",
        )),
        (None, false) => Err(Error::config(
            "either 'borg_repo_url' or 'borg_host' must be defined",
        )),
        (Some(url), false) => Ok(RepoAddress::Url(url)),
        (None, true) => {
            let Some(host) = host else {
                return Err(Error::config(
                    "'borg_user'/'borg_reponame' require 'borg_host' to be defined",
                ));
            };
            let Some(reponame) = reponame else {
                return Err(Error::config(
                    "when using 'borg_host', 'borg_reponame' must be defined",
                ));
            };
            Ok(RepoAddress::Remote {
                host,
                user,
                reponame,
            })
        }
    }
}

/// Reporter settings never fail to resolve, so a rejected configuration can still be
/// reported.
pub fn reporter_settings(raw: &RawOptions) -> ReporterSettings {
    ReporterSettings {
        enabled: raw.publish_entities.unwrap_or(true),
        base_url: non_empty_owned(raw.supervisor_url.as_ref())
            .unwrap_or_else(default_supervisor_url),
        entity_prefix: non_empty_owned(raw.entity_prefix.as_ref())
            .unwrap_or_else(default_entity_prefix),
        ..ReporterSettings::default()
    }
}

fn resolve_restore_selection(raw: &RawOptions) -> Result<RestoreSelection> {
    if let Some(name) = non_empty_owned(raw.backup_name.as_ref()) {
        return Ok(RestoreSelection::Name(name));
    }
    match raw.backup_index {
        None => Ok(RestoreSelection::Newest),
        Some(i) if i >= 1 => Ok(RestoreSelection::Index(i as usize)),
        Some(i) => Err(Error::config(format!(
            "backup index must be 1 or greater, got {i}"
        ))),
    }
}

/// Check the raw options and build the run configuration. No I/O happens here.
pub fn validate(raw: &RawOptions) -> Result<ValidatedConfig> {
    let repo = resolve_address(raw)?;

    let retention = match raw.borg_backup_keep_snapshots {
        None => 5,
        Some(n) if n >= 1 => u32::try_from(n)
            .map_err(|_| Error::config(format!("borg_backup_keep_snapshots too large: {n}")))?,
        Some(n) => {
            return Err(Error::config(format!(
                "borg_backup_keep_snapshots must be a positive integer, got {n}"
            )));
        }
    };

    let compression = match non_empty(raw.borg_compression.as_deref()) {
        None => Compression::Zstd,
        Some(c) => Compression::parse(c).ok_or_else(|| {
            Error::config(format!(
                "invalid compression algorithm '{c}'; valid options are: {}",
                Compression::VALID.join(", ")
            ))
        })?,
    };

    let source_paths: Vec<PathBuf> = raw
        .borg_backup_paths
        .clone()
        .unwrap_or_else(default_backup_paths)
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect();
    if source_paths.is_empty() {
        return Err(Error::config("borg_backup_paths must list at least one path"));
    }

    let retry = RetryPolicy {
        attempts: raw.borg_retry_attempts.unwrap_or(3).max(1),
        initial_backoff: Duration::from_secs(raw.borg_retry_backoff_secs.unwrap_or(5)),
    };

    let passphrase = raw.borg_passphrase.clone().filter(|p| !p.is_empty());
    let mut warnings = Vec::new();
    if passphrase.is_none() {
        warnings.push(SecurityWarning {
            code: "unencrypted_repository",
            message: "No passphrase configured! Backups will NOT be encrypted. \
                      Set 'borg_passphrase' in the configuration."
                .into(),
        });
    }

    let mode = if raw.restore_mode.unwrap_or(false) {
        RunMode::Restore
    } else {
        RunMode::Backup
    };

    let config = RunConfig {
        repo,
        ssh_params: non_empty_owned(raw.borg_ssh_params.as_ref()),
        passphrase,
        compression,
        retention,
        exclude_logs: raw.borg_exclude_logs.unwrap_or(true),
        custom_excludes: raw
            .borg_custom_excludes
            .as_ref()
            .map(ExcludePatterns::patterns)
            .unwrap_or_default(),
        debug: raw.borg_backup_debug.unwrap_or(false),
        mode,
        source_paths,
        restore_selection: resolve_restore_selection(raw)?,
        restore_target: PathBuf::from(
            non_empty_owned(raw.restore_target.as_ref()).unwrap_or_else(default_restore_target),
        ),
        supervisor_snapshot: raw.supervisor_snapshot.unwrap_or(false),
        paths: EnginePaths::from(&raw.paths),
        reporter: reporter_settings(raw),
        retry,
    };

    Ok(ValidatedConfig { config, warnings })
}
