//! Archive creation and retention pruning.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use tracing::{info, warn};

use crate::borg::{CreateOutput, ListedArchive, LogLine, failure_message, parse_time, run_borg};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::profile::CompressionPlan;
use crate::repository::RepositoryHandle;
use crate::restore::list_archives;
use crate::runner::CommandRunner;
use crate::sanitize::sanitize_line;
use crate::status::{Entities, Phase, StatusEvent, StatusPublisher, publish_best_effort};

pub const STANDARD_EXCLUDES: &[&str] = &["*.pyc", "__pycache__", "*.tmp", ".*.swp", ".*.swo", ".*.swn"];

pub const LOG_EXCLUDES: &[&str] = &[
    "*/home-assistant.log*",
    "*/homeassistant.log*",
    "*/.homeassistant/home-assistant.log*",
    "*/logs/*",
    "*/log/*",
    "*/*.log",
    "*/*.log.*",
    "*/supervisor/logs/*",
    "*/addons/*/logs/*",
];

pub const ARCHIVE_NAME_FORMAT: &str = "%Y-%m-%d-%H:%M";

const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub name: String,
    /// Original (uncompressed) size in bytes.
    pub size_bytes: u64,
    pub item_count: u64,
    pub created: Option<NaiveDateTime>,
}

impl From<ListedArchive> for Archive {
    fn from(a: ListedArchive) -> Self {
        let created = a.timestamp();
        let stats = a.stats.unwrap_or_default();
        Self {
            name: a.name,
            size_bytes: stats.original_size,
            item_count: stats.nfiles,
            created,
        }
    }
}

/// Standard patterns, then log patterns when enabled, then custom patterns in order.
pub fn exclusion_list(config: &RunConfig) -> Vec<String> {
    let mut out: Vec<String> = STANDARD_EXCLUDES.iter().map(|s| s.to_string()).collect();
    if config.exclude_logs {
        out.extend(LOG_EXCLUDES.iter().map(|s| s.to_string()));
    }
    out.extend(config.custom_excludes.iter().cloned());
    out
}

/// Minute-resolution name; `-2`, `-3`, ... on collision.
pub fn archive_name_for(now: NaiveDateTime, existing: &[String]) -> String {
    let base = now.format(ARCHIVE_NAME_FORMAT).to_string();
    if !existing.iter().any(|n| *n == base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub compacted: bool,
}

pub struct BackupExecutor<'a> {
    runner: &'a dyn CommandRunner,
    publisher: &'a dyn StatusPublisher,
    entities: &'a Entities,
    progress_interval: Duration,
}

impl<'a> BackupExecutor<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        publisher: &'a dyn StatusPublisher,
        entities: &'a Entities,
    ) -> Self {
        Self {
            runner,
            publisher,
            entities,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Create one archive of `sources`, applying the configured exclusions.
    pub fn run(
        &self,
        handle: &RepositoryHandle,
        config: &RunConfig,
        plan: &CompressionPlan,
        sources: &[PathBuf],
    ) -> Result<Archive> {
        let existing: Vec<String> = list_archives(self.runner, handle)?
            .into_iter()
            .map(|a| a.name)
            .collect();
        let now = Local::now().naive_local();
        let name = archive_name_for(now, &existing);
        let excludes = exclusion_list(config);

        info!(
            archive = %name,
            compression = %plan.compression_spec(),
            excludes = excludes.len(),
            "creating archive"
        );
        publish_best_effort(
            self.publisher,
            &StatusEvent::phase(self.entities, Phase::CreatingBackup)
                .attr("archive", name.clone())
                .with_timestamp(),
        );

        let spec = handle
            .borg
            .create(&name, plan, &excludes, sources);
        let redactor = handle.borg.redactor();
        let mut last_progress: Option<Instant> = None;
        let out = run_borg(self.runner, &spec, &redactor, &mut |record| {
            let LogLine::ArchiveProgress {
                original_size,
                nfiles,
                path,
                finished,
            } = record
            else {
                return;
            };
            if *finished || last_progress.is_some_and(|t| t.elapsed() < self.progress_interval) {
                return;
            }
            last_progress = Some(Instant::now());
            let mut ev = StatusEvent::phase(self.entities, Phase::CreatingBackup)
                .attr("archive", name.clone())
                .attr("original_size", *original_size)
                .attr("nfiles", *nfiles);
            if let Some(p) = path.as_deref() {
                ev = ev.attr("path", redactor.redact(&sanitize_line(p)));
            }
            publish_best_effort(self.publisher, &ev);
        })?;

        // Exit 1 ("completed with warnings") is a failure too: the archive may be incomplete.
        if !out.success() {
            return Err(Error::execution(format!(
                "borg create failed: {}",
                failure_message(&out, &redactor)
            )));
        }

        let archive = match serde_json::from_str::<CreateOutput>(&out.stdout) {
            Ok(created) => Archive {
                created: created.archive.start.as_deref().and_then(parse_time).or(Some(now)),
                size_bytes: created.archive.stats.original_size,
                item_count: created.archive.stats.nfiles,
                name: created.archive.name,
            },
            Err(e) => {
                warn!(error = %e, "borg create printed no stats");
                Archive {
                    name,
                    size_bytes: 0,
                    item_count: 0,
                    created: Some(now),
                }
            }
        };
        info!(
            archive = %archive.name,
            size_bytes = archive.size_bytes,
            files = archive.item_count,
            "archive created"
        );
        Ok(archive)
    }

    /// Keep the `retention` newest archives and delete the rest, then compact once.
    pub fn prune(&self, handle: &RepositoryHandle, retention: u32) -> Result<PruneReport> {
        let archives = list_archives(self.runner, handle)?;
        let keep = (retention as usize).min(archives.len());
        let mut report = PruneReport {
            kept: archives[..keep].iter().map(|a| a.name.clone()).collect(),
            ..PruneReport::default()
        };
        if keep == archives.len() {
            info!(archives = archives.len(), retention, "nothing to prune");
            return Ok(report);
        }

        publish_best_effort(
            self.publisher,
            &StatusEvent::phase(self.entities, Phase::CleaningUp)
                .attr("to_delete", (archives.len() - keep) as u64),
        );
        let redactor = handle.borg.redactor();
        for old in &archives[keep..] {
            info!(archive = %old.name, "deleting archive beyond retention");
            let out = run_borg(self.runner, &handle.borg.delete(&old.name), &redactor, &mut |_| {})?;
            if !out.success() {
                return Err(Error::execution(format!(
                    "borg delete {} failed: {}",
                    old.name,
                    failure_message(&out, &redactor)
                )));
            }
            report.deleted.push(old.name.clone());
        }

        let out = run_borg(self.runner, &handle.borg.compact(), &redactor, &mut |_| {})?;
        if out.success() {
            report.compacted = true;
        } else {
            warn!(
                detail = %failure_message(&out, &redactor),
                "borg compact failed; space will be reclaimed on a later run"
            );
        }
        Ok(report)
    }
}
