//! Top-level run state machine.
//!
//! One call to [`Orchestrator::run`] performs one backup or one restore. States only
//! move forward; the bounded repository retry and the token fallback in the status
//! reporter are the only loops.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::backup::{Archive, BackupExecutor};
use crate::config::{self, EnvOverlay, RawOptions, RunConfig, RunMode, SecurityWarning};
use crate::error::{Error, Result};
use crate::identity::{SshIdentity, SshIdentityManager};
use crate::profile::{CompressionPlan, SystemProfiler};
use crate::repository::{RepositoryHandle, RepositoryManager};
use crate::restore::{RestoreExecutor, select};
use crate::runner::CommandRunner;
use crate::snapshot;
use crate::status::{
    Entities, Phase, StatusEvent, StatusPublisher, StatusReporter, publish_best_effort,
};
use crate::supervisor::{
    CredentialSource, SNAPSHOT_PREFIX, SnapshotApi, SupervisorBackups, SupervisorClient,
    prune_snapshots,
};
use crate::unpack::Unpacker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Validating,
    Profiling,
    Resolving,
    Running,
    Pruning,
    Extracting,
    Reporting,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Validating => "validating",
            RunState::Profiling => "profiling",
            RunState::Resolving => "resolving",
            RunState::Running => "running",
            RunState::Pruning => "pruning",
            RunState::Extracting => "extracting",
            RunState::Reporting => "reporting",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    pub exit_code: i32,
    /// Every state visited, in order, starting with `Idle`.
    pub history: Vec<RunState>,
    pub error: Option<Error>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }
}

struct Silent;

impl StatusPublisher for Silent {
    fn publish(&self, _event: &StatusEvent) -> Result<()> {
        Ok(())
    }
}

/// Per-run bookkeeping.
struct Tracker {
    history: Vec<RunState>,
    warnings: Vec<SecurityWarning>,
}

impl Tracker {
    fn enter(&mut self, state: RunState) {
        info!(state = state.as_str(), "run state");
        self.history.push(state);
    }

    /// Publishes every pending warning as one event on the security entity.
    fn flush_warnings(&mut self, publisher: &dyn StatusPublisher, entities: &Entities) {
        if self.warnings.is_empty() {
            return;
        }
        let codes: Vec<&str> = self.warnings.iter().map(|w| w.code).collect();
        let messages: Vec<&str> = self.warnings.iter().map(|w| w.message.as_str()).collect();
        let event = StatusEvent::new(entities.security.clone(), "warning")
            .attr("codes", codes.join(","))
            .attr("message", messages.join(" "))
            .with_timestamp();
        publish_best_effort(publisher, &event);
        self.warnings.clear();
    }
}

pub struct Orchestrator {
    runner: Arc<dyn CommandRunner>,
    credentials: Vec<CredentialSource>,
    publisher: Option<Arc<dyn StatusPublisher>>,
    snapshots: Option<Arc<dyn SnapshotApi>>,
    profiler: SystemProfiler,
    sleep: fn(Duration),
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, credentials: Vec<CredentialSource>) -> Self {
        Self {
            runner,
            credentials,
            publisher: None,
            snapshots: None,
            profiler: SystemProfiler::default(),
            sleep: std::thread::sleep,
        }
    }

    /// Use this publisher instead of the HTTP reporter built from the run configuration.
    pub fn with_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Use this backups API instead of the supervisor client built from the run
    /// configuration.
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotApi>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_profiler(mut self, profiler: SystemProfiler) -> Self {
        self.profiler = profiler;
        self
    }

    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn run(&self, raw: RawOptions, overlay: &EnvOverlay) -> RunOutcome {
        self.run_loaded(Ok(raw), overlay)
    }

    /// Like [`Orchestrator::run`], but a failed options load is reported through the
    /// normal failure path.
    pub fn run_loaded(&self, loaded: Result<RawOptions>, overlay: &EnvOverlay) -> RunOutcome {
        let mut tracker = Tracker {
            history: vec![RunState::Idle],
            warnings: Vec::new(),
        };
        tracker.enter(RunState::Validating);

        let (mut raw, load_error) = match loaded {
            Ok(raw) => (raw, None),
            Err(e) => (RawOptions::default(), Some(e)),
        };
        let validated = match load_error {
            Some(e) => Err(e),
            None => overlay.apply(&mut raw).and_then(|()| config::validate(&raw)),
        };
        let settings = config::reporter_settings(&raw);
        let publisher = self.publisher_for(&settings);
        let entities = Entities::new(&settings.entity_prefix);
        let fallback_mode = if raw.restore_mode.unwrap_or(false) {
            RunMode::Restore
        } else {
            RunMode::Backup
        };

        let validated = match validated {
            Ok(v) => v,
            Err(e) => return fail(tracker, publisher.as_ref(), &entities, fallback_mode, e),
        };
        let config = validated.config;
        for w in &validated.warnings {
            warn!(code = w.code, "{}", w.message);
        }
        tracker.warnings = validated.warnings;

        let result = self.execute(&config, publisher.as_ref(), &entities, &mut tracker);
        cleanup_staging(&config.paths.staging_dir);

        match result {
            Ok(()) => {
                tracker.enter(RunState::Done);
                RunOutcome {
                    state: RunState::Done,
                    exit_code: 0,
                    history: tracker.history,
                    error: None,
                }
            }
            Err(e) => fail(tracker, publisher.as_ref(), &entities, config.mode, e),
        }
    }

    fn publisher_for(&self, settings: &config::ReporterSettings) -> Arc<dyn StatusPublisher> {
        if let Some(p) = self.publisher.as_ref() {
            return p.clone();
        }
        match StatusReporter::new(settings.clone(), self.credentials.clone()) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!(error = %e, "status reporting disabled");
                Arc::new(Silent)
            }
        }
    }

    fn snapshot_api(&self, config: &RunConfig) -> Result<Arc<dyn SnapshotApi>> {
        if let Some(api) = self.snapshots.as_ref() {
            return Ok(api.clone());
        }
        let client = SupervisorClient::new(
            config.reporter.base_url.clone(),
            config.reporter.timeout,
            self.credentials.clone(),
        )?;
        Ok(Arc::new(SupervisorBackups::new(client)))
    }

    fn secrets(&self) -> Vec<String> {
        self.credentials
            .iter()
            .filter_map(|c| c.token())
            .map(str::to_string)
            .collect()
    }

    fn execute(
        &self,
        config: &RunConfig,
        publisher: &dyn StatusPublisher,
        entities: &Entities,
        tracker: &mut Tracker,
    ) -> Result<()> {
        let runner = self.runner.as_ref();

        tracker.enter(RunState::Profiling);
        for event in entities.initial_events() {
            publish_best_effort(publisher, &event);
        }
        let profile = self.profiler.profile();
        let plan = CompressionPlan::derive(&profile, config.compression);
        info!(
            cores = profile.cpu_cores,
            memory_mb = profile.available_memory_mb,
            storage = profile.storage.as_str(),
            compression = %plan.compression_spec(),
            parallel = plan.parallel,
            "compression plan"
        );
        let opening = match config.mode {
            RunMode::Backup => Phase::Running,
            RunMode::Restore => Phase::RestoreMode,
        };
        publish_best_effort(
            publisher,
            &StatusEvent::phase(entities, opening)
                .attr("mode", config.mode.as_str())
                .with_timestamp(),
        );
        let identity = SshIdentityManager::new(&config.paths.ssh_key, runner).ensure_identity()?;

        tracker.enter(RunState::Resolving);
        let repos = RepositoryManager::new(runner)
            .with_status(publisher, entities)
            .with_secrets(self.secrets());
        let handle = self.resolve_with_retry(&repos, config, &identity)?;
        tracker.warnings.extend(handle.warnings.iter().cloned());
        tracker.flush_warnings(publisher, entities);

        tracker.enter(RunState::Running);
        match config.mode {
            RunMode::Backup => self.backup(config, &plan, &handle, &repos, publisher, entities, tracker),
            RunMode::Restore => self.restore(config, &plan, &handle, publisher, entities, tracker),
        }
    }

    fn resolve_with_retry(
        &self,
        repos: &RepositoryManager<'_>,
        config: &RunConfig,
        identity: &SshIdentity,
    ) -> Result<RepositoryHandle> {
        let attempts = config.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match repos.resolve(config, identity) {
                Err(e)
                    if attempt < attempts
                        && e.repository_kind().is_some_and(|k| k.retryable()) =>
                {
                    let delay = config.retry.backoff_for(attempt);
                    warn!(
                        attempt,
                        attempts,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "repository unreachable, retrying"
                    );
                    (self.sleep)(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn backup(
        &self,
        config: &RunConfig,
        plan: &CompressionPlan,
        handle: &RepositoryHandle,
        repos: &RepositoryManager<'_>,
        publisher: &dyn StatusPublisher,
        entities: &Entities,
        tracker: &mut Tracker,
    ) -> Result<()> {
        let exec = BackupExecutor::new(self.runner.as_ref(), publisher, entities);
        let mut sources = config.source_paths.clone();
        let mut ha_snapshot = None;
        if config.supervisor_snapshot {
            let api = self.snapshot_api(config)?;
            let (slug, staged) =
                self.stage_supervisor_snapshot(api.as_ref(), config, plan, publisher, entities)?;
            sources = vec![staged];
            ha_snapshot = Some((api, slug));
        }
        let archive = exec.run(handle, config, plan, &sources)?;

        tracker.enter(RunState::Pruning);
        let pruned = exec.prune(handle, config.retention)?;
        if let Some((api, _)) = ha_snapshot.as_ref() {
            match prune_snapshots(api.as_ref(), config.retention) {
                Ok(removed) => info!(removed = removed.len(), "supervisor snapshots pruned"),
                Err(e) => warn!(error = %e, "could not prune supervisor snapshots"),
            }
        }

        tracker.enter(RunState::Reporting);
        let now = chrono::Local::now().to_rfc3339();
        publish_best_effort(
            publisher,
            &StatusEvent::new(entities.last.clone(), now.clone())
                .attr("backup_name", archive.name.clone())
                .attr("status", "success")
                .attr("size_bytes", archive.size_bytes)
                .attr("files", archive.item_count),
        );
        match repos.repository_info(handle) {
            Ok(stats) => {
                let mut ev = StatusEvent::new(entities.repository.clone(), stats.size_gb.to_string())
                    .attr("total_archives", stats.archives as u64)
                    .attr("encryption", stats.encryption);
                if let Some(m) = stats.last_modified {
                    ev = ev.attr("last_modified", m);
                }
                if let Some(r) = stats.compression_ratio {
                    ev = ev.attr("compression_ratio", r);
                }
                publish_best_effort(publisher, &ev);
            }
            Err(e) => warn!(error = %e, "could not read repository statistics"),
        }
        publish_best_effort(
            publisher,
            &StatusEvent::new(entities.available.clone(), "on").attr("repository", handle.location()),
        );
        publish_best_effort(
            publisher,
            &completed_event(
                entities,
                now,
                archive,
                pruned.deleted.len(),
                ha_snapshot.map(|(_, slug)| slug),
            ),
        );
        Ok(())
    }

    /// Have the supervisor take a full snapshot and unpack it into staging. Returns the
    /// snapshot's slug and staged directory.
    fn stage_supervisor_snapshot(
        &self,
        api: &dyn SnapshotApi,
        config: &RunConfig,
        plan: &CompressionPlan,
        publisher: &dyn StatusPublisher,
        entities: &Entities,
    ) -> Result<(String, PathBuf)> {
        let name = format!(
            "{SNAPSHOT_PREFIX}{}",
            chrono::Local::now().format("%Y-%m-%d-%H:%M")
        );
        publish_best_effort(
            publisher,
            &StatusEvent::phase(entities, Phase::CreatingHaBackup)
                .attr("name", name.clone())
                .with_timestamp(),
        );
        info!(name = %name, "requesting supervisor full snapshot");
        let slug = api.create_full(&name)?;

        publish_best_effort(
            publisher,
            &StatusEvent::phase(entities, Phase::Unpacking).attr("slug", slug.clone()),
        );
        let staged = config.paths.staging_dir.join(&slug);
        let tarball = snapshot::snapshot_tarball(&config.paths.supervisor_backup_dir, &slug);
        snapshot::stage_snapshot(&Unpacker::new(self.runner.as_ref(), plan), &tarball, &staged)?;
        Ok((slug, staged))
    }

    fn restore(
        &self,
        config: &RunConfig,
        plan: &CompressionPlan,
        handle: &RepositoryHandle,
        publisher: &dyn StatusPublisher,
        entities: &Entities,
        tracker: &mut Tracker,
    ) -> Result<()> {
        let exec = RestoreExecutor::new(
            self.runner.as_ref(),
            publisher,
            entities,
            plan,
            &config.paths.staging_dir,
        );
        publish_best_effort(publisher, &StatusEvent::phase(entities, Phase::ListingBackups));
        let archives = exec.list_archives(handle)?;
        let names: Vec<&str> = archives.iter().map(|a| a.name.as_str()).collect();
        let mut listing = StatusEvent::new(entities.available_backups.clone(), names.len().to_string())
            .attr("backup_list", names.join(", "));
        if let Some(latest) = names.first() {
            listing = listing.attr("latest_backup", *latest);
        }
        publish_best_effort(publisher, &listing);
        publish_best_effort(
            publisher,
            &StatusEvent::new(
                entities.available.clone(),
                if names.is_empty() { "off" } else { "on" },
            ),
        );

        let archive = select(&archives, &config.restore_selection)?;
        info!(archive = %archive.name, target = %config.restore_target.display(), "restoring");

        tracker.enter(RunState::Extracting);
        if config.supervisor_snapshot {
            let api = self.snapshot_api(config)?;
            exec.extract(handle, &archive)?;
            let staged = snapshot::find_staged(exec.staging()).ok_or_else(|| {
                Error::execution(format!("archive {} holds no supervisor snapshot", archive.name))
            })?;
            let unpacker = Unpacker::new(self.runner.as_ref(), plan);
            let slug = snapshot::repack(&unpacker, &staged, &config.paths.supervisor_backup_dir)?;
            info!(archive = %archive.name, slug = %slug, "handing snapshot to the supervisor");
            api.restore_full(&slug)?;

            tracker.enter(RunState::Reporting);
            publish_best_effort(
                publisher,
                &StatusEvent::phase(entities, Phase::Restarting)
                    .attr("message", "Home Assistant is restarting to complete restore")
                    .attr("archive", archive.name.clone())
                    .attr("restored_backup", slug)
                    .with_timestamp(),
            );
            return Ok(());
        }
        let result = exec.restore(handle, &archive, &config.restore_target)?;

        tracker.enter(RunState::Reporting);
        publish_best_effort(
            publisher,
            &StatusEvent::phase(entities, Phase::RestoreCompleted)
                .attr("archive", result.archive.name.clone())
                .attr("target", result.target.display().to_string())
                .attr("nested_unpacked", result.nested_unpacked.len() as u64)
                .attr("left_packed", result.depth_limited.len() as u64)
                .with_timestamp(),
        );
        Ok(())
    }
}

fn completed_event(
    entities: &Entities,
    now: String,
    archive: Archive,
    pruned: usize,
    snapshot: Option<String>,
) -> StatusEvent {
    let mut event = StatusEvent::phase(entities, Phase::Completed)
        .attr("last_completed", now)
        .attr("last_backup_name", archive.name)
        .attr("pruned", pruned as u64);
    if let Some(slug) = snapshot {
        event = event.attr("ha_backup", slug);
    }
    event
}

fn fail(
    mut tracker: Tracker,
    publisher: &dyn StatusPublisher,
    entities: &Entities,
    mode: RunMode,
    err: Error,
) -> RunOutcome {
    error!(kind = err.kind(), "{err}");
    tracker.flush_warnings(publisher, entities);

    let phase = match mode {
        RunMode::Backup => Phase::Error,
        RunMode::Restore => Phase::RestoreError,
    };
    let mut event = StatusEvent::phase(entities, phase)
        .attr("error_kind", err.kind())
        .attr("error_message", err.detail())
        .with_timestamp();
    if let Some(kind) = err.repository_kind() {
        event = event.attr("repository_error", kind.as_str());
    }
    publish_best_effort(publisher, &event);
    publish_best_effort(
        publisher,
        &StatusEvent::new(entities.available.clone(), "off").attr("last_error", err.detail()),
    );

    tracker.enter(RunState::Failed);
    RunOutcome {
        state: RunState::Failed,
        exit_code: err.exit_code(),
        history: tracker.history,
        error: Some(err),
    }
}

fn cleanup_staging(dir: &Path) {
    if !dir.exists() {
        return;
    }
    match fs::remove_dir_all(dir) {
        Ok(()) => info!(path = %dir.display(), "removed staging directory"),
        Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove staging directory"),
    }
}
