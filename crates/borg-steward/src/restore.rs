//! Archive listing, extraction, and unpacking of archives nested inside the restore.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::backup::Archive;
use crate::borg::{ListOutput, failure_message, run_borg};
use crate::config::RestoreSelection;
use crate::error::{Error, Result};
use crate::profile::CompressionPlan;
use crate::repository::RepositoryHandle;
use crate::runner::CommandRunner;
use crate::status::{Entities, Phase, StatusEvent, StatusPublisher, publish_best_effort};
use crate::unpack::{MAX_NESTED_DEPTH, Unpacker};

/// All archives in the repository, newest first.
pub fn list_archives(runner: &dyn CommandRunner, handle: &RepositoryHandle) -> Result<Vec<Archive>> {
    let redactor = handle.borg.redactor();
    let out = run_borg(runner, &handle.borg.list_json(), &redactor, &mut |_| {})?;
    if !out.success() {
        return Err(Error::execution(format!(
            "borg list failed: {}",
            failure_message(&out, &redactor)
        )));
    }
    let listing: ListOutput = if out.stdout.trim().is_empty() {
        ListOutput::default()
    } else {
        serde_json::from_str(&out.stdout)?
    };
    let mut archives: Vec<Archive> = listing.archives.into_iter().map(Archive::from).collect();
    // Stable: archives without a timestamp sort last and keep listing order.
    archives.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(archives)
}

/// Pick the archive to restore. Index is 1-based over the newest-first listing.
pub fn select(archives: &[Archive], selection: &RestoreSelection) -> Result<Archive> {
    if archives.is_empty() {
        return Err(Error::execution("no archives found in repository"));
    }
    match selection {
        RestoreSelection::Newest => Ok(archives[0].clone()),
        RestoreSelection::Name(name) => archives
            .iter()
            .find(|a| a.name == *name)
            .cloned()
            .ok_or_else(|| Error::execution(format!("archive '{name}' not found"))),
        RestoreSelection::Index(i) => archives.get(i.saturating_sub(1)).cloned().ok_or_else(|| {
            Error::execution(format!(
                "archive index {i} out of range (1..={})",
                archives.len()
            ))
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreResult {
    pub archive: Archive,
    pub target: PathBuf,
    /// Directories nested archives were unpacked into, relative to `target`.
    pub nested_unpacked: Vec<PathBuf>,
    /// Nested archives left packed because of the depth bound, relative to `target`.
    pub depth_limited: Vec<PathBuf>,
}

pub struct RestoreExecutor<'a> {
    runner: &'a dyn CommandRunner,
    publisher: &'a dyn StatusPublisher,
    entities: &'a Entities,
    plan: &'a CompressionPlan,
    staging: PathBuf,
}

impl<'a> RestoreExecutor<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        publisher: &'a dyn StatusPublisher,
        entities: &'a Entities,
        plan: &'a CompressionPlan,
        staging: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            publisher,
            entities,
            plan,
            staging: staging.into(),
        }
    }

    pub fn list_archives(&self, handle: &RepositoryHandle) -> Result<Vec<Archive>> {
        list_archives(self.runner, handle)
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Extract `archive` into a fresh staging directory.
    pub fn extract(&self, handle: &RepositoryHandle, archive: &Archive) -> Result<()> {
        if self.staging.exists() {
            fs::remove_dir_all(&self.staging)?;
        }
        fs::create_dir_all(&self.staging)?;

        info!(archive = %archive.name, staging = %self.staging.display(), "extracting archive");
        publish_best_effort(
            self.publisher,
            &StatusEvent::phase(self.entities, Phase::Extracting).attr("archive", archive.name.clone()),
        );
        let redactor = handle.borg.redactor();
        let out = run_borg(
            self.runner,
            &handle.borg.extract(&archive.name, &self.staging),
            &redactor,
            &mut |_| {},
        )?;
        if !out.success() {
            return Err(Error::execution(format!(
                "borg extract {} failed: {}",
                archive.name,
                failure_message(&out, &redactor)
            )));
        }
        Ok(())
    }

    /// Extract `archive` into staging, unpack nested archives, then move everything into
    /// `target`.
    pub fn restore(
        &self,
        handle: &RepositoryHandle,
        archive: &Archive,
        target: &Path,
    ) -> Result<RestoreResult> {
        self.extract(handle, archive)?;

        publish_best_effort(
            self.publisher,
            &StatusEvent::phase(self.entities, Phase::Unpacking).attr("archive", archive.name.clone()),
        );
        let nested = Unpacker::new(self.runner, self.plan).unpack_nested(&self.staging)?;
        for p in &nested.depth_limited {
            warn!(path = %p.display(), depth = MAX_NESTED_DEPTH, "nested archive left packed");
        }

        fs::create_dir_all(target)?;
        move_children(&self.staging, target)?;
        fs::remove_dir_all(&self.staging)?;

        let relative = |p: &PathBuf| p.strip_prefix(&self.staging).unwrap_or(p).to_path_buf();
        let result = RestoreResult {
            archive: archive.clone(),
            target: target.to_path_buf(),
            nested_unpacked: nested.unpacked.iter().map(|u| relative(&u.dir)).collect(),
            depth_limited: nested.depth_limited.iter().map(relative).collect(),
        };
        info!(
            archive = %archive.name,
            target = %target.display(),
            nested = result.nested_unpacked.len(),
            "restore complete"
        );
        Ok(result)
    }
}

fn move_children(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dst = to.join(entry.file_name());
        if dst.is_dir() && !dst.is_symlink() {
            fs::remove_dir_all(&dst)?;
        } else if dst.exists() || dst.is_symlink() {
            fs::remove_file(&dst)?;
        }
        if fs::rename(entry.path(), &dst).is_err() {
            // Different filesystem: copy, then drop the source.
            copy_tree(&entry.path(), &dst)?;
            if entry.path().is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::execution(format!("walk {}: {e}", src.display())))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let out = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&out)?;
        } else if ft.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &out)?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &out)?;
        }
    }
    Ok(())
}
