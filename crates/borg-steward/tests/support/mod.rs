#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use borg_steward::config::RawOptions;
use borg_steward::error::{Error, Result};
use borg_steward::profile::SystemProfiler;
use borg_steward::runner::{CommandOutput, CommandRunner, CommandSpec, Stream};
use borg_steward::status::{StatusEvent, StatusPublisher};
use borg_steward::supervisor::{SnapshotApi, SupervisorBackup};
use serde_json::json;

/// What the next `borg info` answers, ahead of the repository's real state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFault {
    Unreachable,
    Corrupted,
}

#[derive(Debug, Default)]
pub struct RepoState {
    pub initialized: bool,
    /// Passphrase the repository was created with; `None` means unencrypted.
    pub passphrase: Option<String>,
    pub encryption: String,
    /// `(name, time)` pairs in creation order.
    pub archives: Vec<(String, String)>,
    pub faults: VecDeque<ProbeFault>,
    pub fail_create: bool,
    /// Exit 1 from `borg create`: borg's "completed with warnings".
    pub create_warns: bool,
    /// Stderr of a failing `borg create`.
    pub create_stderr: Option<String>,
    pub fail_compact: bool,
    pub fail_keygen: bool,
    /// Files written into the extract directory, relative path and content.
    pub archive_files: Vec<(String, String)>,
    /// Source paths of every `borg create`.
    pub created_from: Vec<Vec<String>>,
    /// File names of the archives `tar -c` wrote.
    pub packed: Vec<String>,
}

/// In-memory stand-in for borg, ssh-keygen and tar. `tar -x` of a `{slug}.tar` yields a
/// snapshot holding `backup.json` and `homeassistant.tar.gz`; the latter unpacks into
/// `data/configuration.yaml`.
#[derive(Default)]
pub struct FakeBorg {
    pub state: Mutex<RepoState>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeBorg {
    pub fn new(state: RepoState) -> Self {
        Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// `program subcommand` for every call, e.g. `borg info`.
    pub fn summary(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| match c.program.as_str() {
                "borg" => format!("borg {}", c.subcommand().unwrap_or("")),
                other => other.to_string(),
            })
            .collect()
    }

    pub fn count(&self, what: &str) -> usize {
        self.summary().iter().filter(|s| *s == what).count()
    }

    pub fn archive_names(&self) -> Vec<String> {
        let st = self.state.lock().expect("state lock");
        st.archives.iter().map(|(n, _)| n.clone()).collect()
    }

    fn borg(&self, spec: &CommandSpec, on_line: &mut dyn FnMut(Stream, &str)) -> CommandOutput {
        let mut st = self.state.lock().expect("state lock");
        let archive_arg = spec
            .args
            .iter()
            .find_map(|a| a.split_once("::").map(|(_, n)| n.to_string()));

        match spec.subcommand().unwrap_or("") {
            "info" => {
                if let Some(fault) = st.faults.pop_front() {
                    return match fault {
                        ProbeFault::Unreachable => CommandOutput::failed(
                            2,
                            "Remote: ssh: connect to host nas port 22: Connection refused\n\
                             Connection closed by remote host",
                        ),
                        ProbeFault::Corrupted => CommandOutput::failed(
                            2,
                            "Data integrity error: segment 12 checksum mismatch",
                        ),
                    };
                }
                if !st.initialized {
                    return CommandOutput::failed(2, "Repository /srv/ha does not exist.");
                }
                // Unencrypted repositories ignore whatever passphrase is exported.
                if let Some(expected) = st.passphrase.as_deref() {
                    match spec.env_value("BORG_PASSPHRASE") {
                        Some(given) if given == expected => {}
                        Some(_) => {
                            return CommandOutput::failed(
                                2,
                                "passphrase supplied in BORG_PASSPHRASE is incorrect.",
                            );
                        }
                        None => {
                            return CommandOutput::failed(
                                2,
                                "Can not acquire a passphrase: stdin is not a tty",
                            );
                        }
                    }
                }
                let info = json!({
                    "cache": {"stats": {"total_size": 4000, "total_csize": 2000, "unique_csize": 1073741824u64}},
                    "repository": {"id": "abc123", "last_modified": "2026-10-18T10:00:00.000000"},
                    "encryption": {"mode": st.encryption},
                    "archives": [],
                });
                CommandOutput::ok().with_stdout(info.to_string())
            }
            "init" => {
                let mode = spec
                    .args
                    .iter()
                    .find_map(|a| a.strip_prefix("--encryption="))
                    .unwrap_or("none")
                    .to_string();
                st.initialized = true;
                st.passphrase = spec.env_value("BORG_PASSPHRASE").map(str::to_string);
                st.encryption = mode;
                CommandOutput::ok()
            }
            "check" => CommandOutput::ok(),
            "list" => {
                let archives: Vec<_> = st
                    .archives
                    .iter()
                    .map(|(name, time)| json!({"name": name, "time": time}))
                    .collect();
                CommandOutput::ok().with_stdout(json!({ "archives": archives }).to_string())
            }
            "create" => {
                if st.fail_create {
                    let stderr = st
                        .create_stderr
                        .clone()
                        .unwrap_or_else(|| "/config: [Errno 13] Permission denied".into());
                    return CommandOutput::failed(2, &stderr);
                }
                if st.create_warns {
                    return CommandOutput::failed(
                        1,
                        "/config/home-assistant.log: file changed while we backed it up",
                    );
                }
                let sources: Vec<String> = spec
                    .args
                    .iter()
                    .skip_while(|a| !a.contains("::"))
                    .skip(1)
                    .cloned()
                    .collect();
                st.created_from.push(sources);
                let name = archive_arg.unwrap_or_default();
                on_line(
                    Stream::Stderr,
                    r#"{"type":"archive_progress","original_size":10,"nfiles":1,"path":"config/a.yaml","finished":false}"#,
                );
                let time = chrono::Local::now()
                    .naive_local()
                    .format("%Y-%m-%dT%H:%M:%S%.6f")
                    .to_string();
                st.archives.push((name.clone(), time));
                let out = json!({
                    "archive": {
                        "name": name,
                        "stats": {"original_size": 2048, "compressed_size": 1024, "deduplicated_size": 512, "nfiles": 3}
                    }
                });
                CommandOutput::ok().with_stdout(out.to_string())
            }
            "delete" => {
                let name = archive_arg.unwrap_or_default();
                st.archives.retain(|(n, _)| *n != name);
                CommandOutput::ok()
            }
            "compact" if st.fail_compact => CommandOutput::failed(2, "compaction failed"),
            "compact" => CommandOutput::ok(),
            "extract" => {
                let Some(dir) = spec.cwd.as_ref() else {
                    return CommandOutput::failed(2, "no working directory");
                };
                for (rel, content) in &st.archive_files {
                    let path = dir.join(rel);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).expect("mkdir");
                    }
                    fs::write(path, content).expect("write extracted file");
                }
                CommandOutput::ok()
            }
            other => CommandOutput::failed(2, &format!("unexpected borg subcommand {other}")),
        }
    }
}

impl CommandRunner for FakeBorg {
    fn run(
        &self,
        spec: &CommandSpec,
        on_line: &mut dyn FnMut(Stream, &str),
    ) -> Result<CommandOutput> {
        self.calls.lock().expect("calls lock").push(spec.clone());
        match spec.program.as_str() {
            "borg" => Ok(self.borg(spec, on_line)),
            "ssh-keygen" if self.state.lock().expect("state lock").fail_keygen => Ok(
                CommandOutput::failed(1, "Saving key failed: Permission denied"),
            ),
            "ssh-keygen" => {
                let idx = spec.args.iter().position(|a| a == "-f").expect("-f");
                let key = PathBuf::from(&spec.args[idx + 1]);
                write_key_pair(&key);
                Ok(CommandOutput::ok())
            }
            "tar" => Ok(self.tar(spec)),
            other => Ok(CommandOutput::failed(127, &format!("{other}: not found"))),
        }
    }
}

impl FakeBorg {
    fn tar(&self, spec: &CommandSpec) -> CommandOutput {
        let Some(mode) = spec
            .args
            .iter()
            .position(|a| a.starts_with('-') && a.ends_with('f') && a != "-f")
        else {
            return CommandOutput::failed(2, "tar: no mode flag");
        };
        let archive = PathBuf::from(&spec.args[mode + 1]);
        let Some(dir) = spec
            .args
            .iter()
            .position(|a| a == "-C")
            .map(|i| PathBuf::from(&spec.args[i + 1]))
        else {
            return CommandOutput::failed(2, "tar: no -C");
        };
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if spec.args[mode].contains('c') {
            if !dir.is_dir() {
                return CommandOutput::failed(2, &format!("tar: {}: Cannot open", dir.display()));
            }
            fs::write(&archive, format!("packed from {}", dir.display())).expect("write archive");
            self.state.lock().expect("state lock").packed.push(name);
            return CommandOutput::ok();
        }
        if !archive.exists() {
            return CommandOutput::failed(2, &format!("tar: {name}: Cannot open"));
        }
        if name == "homeassistant.tar.gz" {
            fs::create_dir_all(dir.join("data")).expect("mkdir");
            fs::write(dir.join("data/configuration.yaml"), "homeassistant:").expect("write");
        } else {
            let slug = name.trim_end_matches(".tar");
            fs::write(dir.join("backup.json"), json!({ "slug": slug }).to_string()).expect("write");
            fs::write(dir.join("homeassistant.tar.gz"), "packed").expect("write");
        }
        CommandOutput::ok()
    }
}

/// Supervisor backups API kept in memory. Snapshot tarballs are real files in
/// `backup_dir`.
pub struct FakeSnapshots {
    pub backup_dir: PathBuf,
    pub backups: Mutex<Vec<SupervisorBackup>>,
    pub created: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub restored: Mutex<Vec<String>>,
}

impl FakeSnapshots {
    pub fn new(backup_dir: PathBuf, existing: Vec<SupervisorBackup>) -> Self {
        fs::create_dir_all(&backup_dir).expect("backup dir");
        Self {
            backup_dir,
            backups: Mutex::new(existing),
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            restored: Mutex::new(Vec::new()),
        }
    }

    pub fn slugs(&self) -> Vec<String> {
        let backups = self.backups.lock().expect("backups lock");
        backups.iter().map(|b| b.slug.clone()).collect()
    }
}

pub fn supervisor_backup(slug: &str, name: &str, day: u32) -> SupervisorBackup {
    SupervisorBackup {
        slug: slug.into(),
        name: name.into(),
        date: format!("2026-10-{day:02}T02:00:00+00:00"),
    }
}

impl SnapshotApi for FakeSnapshots {
    fn create_full(&self, name: &str) -> Result<String> {
        let mut created = self.created.lock().expect("created lock");
        created.push(name.to_string());
        let slug = format!("c0ffee{:02}", created.len());
        fs::write(self.backup_dir.join(format!("{slug}.tar")), "outer")?;
        self.backups
            .lock()
            .expect("backups lock")
            .push(supervisor_backup(&slug, name, 18));
        Ok(slug)
    }

    fn list(&self) -> Result<Vec<SupervisorBackup>> {
        Ok(self.backups.lock().expect("backups lock").clone())
    }

    fn remove(&self, slug: &str) -> Result<()> {
        self.backups.lock().expect("backups lock").retain(|b| b.slug != slug);
        self.removed.lock().expect("removed lock").push(slug.to_string());
        Ok(())
    }

    fn restore_full(&self, slug: &str) -> Result<()> {
        if !self.backup_dir.join(format!("{slug}.tar")).exists() {
            return Err(Error::execution(format!(
                "supervisor backups API: /backups/{slug}/restore/full failed with status 404"
            )));
        }
        self.restored.lock().expect("restored lock").push(slug.to_string());
        Ok(())
    }
}

/// A syntactically valid `ssh-ed25519` public key line.
pub fn ed25519_public_line(seed: u8) -> String {
    let signing = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    let point = signing.verifying_key().to_bytes();
    let mut blob = Vec::new();
    blob.extend_from_slice(&(11u32).to_be_bytes());
    blob.extend_from_slice(b"ssh-ed25519");
    blob.extend_from_slice(&(32u32).to_be_bytes());
    blob.extend_from_slice(&point);
    format!("ssh-ed25519 {} root@local-borg-backup", STANDARD.encode(blob))
}

pub fn write_key_pair(key: &Path) {
    if let Some(parent) = key.parent() {
        fs::create_dir_all(parent).expect("key dir");
    }
    fs::write(key, "PRIVATE").expect("private key");
    let mut pub_path = key.as_os_str().to_owned();
    pub_path.push(".pub");
    fs::write(PathBuf::from(pub_path), ed25519_public_line(3)).expect("public key");
}

/// Records every event; optionally fails every publish after recording it.
#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<StatusEvent>>,
    pub fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn for_entity(&self, entity: &str) -> Vec<StatusEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.entity_id == entity)
            .collect()
    }

    pub fn states(&self, entity: &str) -> Vec<String> {
        self.for_entity(entity).into_iter().map(|e| e.state).collect()
    }
}

impl StatusPublisher for RecordingPublisher {
    fn publish(&self, event: &StatusEvent) -> Result<()> {
        self.events.lock().expect("events lock").push(event.clone());
        if self.fail {
            return Err(Error::reporting("supervisor API returned 500"));
        }
        Ok(())
    }
}

/// Profiler that reads nothing from the host.
pub fn fixture_profiler(root: &Path) -> SystemProfiler {
    SystemProfiler {
        meminfo: root.join("missing-meminfo"),
        mounts: root.join("missing-mounts"),
        sys_block: root.join("missing-sys-block"),
        root: PathBuf::from("/"),
        cpu_cores: Some(2),
    }
}

/// Options pointing every engine path into `root`.
pub fn options(root: &Path) -> RawOptions {
    let mut raw = RawOptions {
        borg_host: Some("nas".into()),
        borg_user: Some("borg".into()),
        borg_reponame: Some("/srv/ha".into()),
        borg_backup_paths: Some(vec![root.join("config").display().to_string()]),
        restore_target: Some(root.join("restored").display().to_string()),
        ..RawOptions::default()
    };
    let dir = |name: &str| root.join(name).display().to_string();
    raw.paths.base_dir = dir("borg");
    raw.paths.cache_dir = dir("borg/cache");
    raw.paths.staging_dir = dir("staging");
    raw.paths.known_hosts = dir("borg/known_hosts");
    raw.paths.ssh_key = dir("borg/keys/borg_backup");
    raw
}

pub fn archive(name: &str, minute: u32) -> (String, String) {
    (name.to_string(), format!("2026-01-01T00:{minute:02}:00.000000"))
}
