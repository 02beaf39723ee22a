//! `tar` archives nested inside a staged tree: breadth-first unpacking and repacking.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::profile::CompressionPlan;
use crate::runner::{CommandRunner, CommandSpec};

/// Nested archives deeper than this are left packed.
pub const MAX_NESTED_DEPTH: usize = 4;

const NESTED_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".tar"];

/// One nested archive that was unpacked. The archive file itself is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    pub archive: PathBuf,
    pub dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct NestedReport {
    /// In unpack order: every entry's archive lies in the root or in an earlier `dir`.
    pub unpacked: Vec<Unpacked>,
    /// Archives left packed because of the depth bound.
    pub depth_limited: Vec<PathBuf>,
}

/// Runs `tar` through the command runner, using pigz when the plan allows it.
pub struct Unpacker<'a> {
    runner: &'a dyn CommandRunner,
    plan: &'a CompressionPlan,
}

impl<'a> Unpacker<'a> {
    pub fn new(runner: &'a dyn CommandRunner, plan: &'a CompressionPlan) -> Self {
        Self { runner, plan }
    }

    /// Breadth-first: each round unpacks the archives found in the previous round's output.
    pub fn unpack_nested(&self, root: &Path) -> Result<NestedReport> {
        let mut report = NestedReport::default();
        let mut frontier = vec![root.to_path_buf()];

        for depth in 1..=MAX_NESTED_DEPTH + 1 {
            let found: BTreeSet<PathBuf> = frontier.iter().flat_map(|d| find_nested(d)).collect();
            if found.is_empty() {
                break;
            }
            if depth > MAX_NESTED_DEPTH {
                report.depth_limited.extend(found);
                break;
            }

            let batch: Vec<PathBuf> = found.into_iter().collect();
            let concurrency = self.plan.extract_concurrency.max(1);
            let mut next = Vec::new();
            for chunk in batch.chunks(concurrency) {
                let results: Vec<Result<Unpacked>> = std::thread::scope(|s| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|archive| s.spawn(move || self.unpack_one(archive)))
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| {
                            h.join()
                                .unwrap_or_else(|_| Err(Error::execution("unpack worker panicked")))
                        })
                        .collect()
                });
                for r in results {
                    let done = r?;
                    next.push(done.dir.clone());
                    report.unpacked.push(done);
                }
            }
            debug!(depth, count = next.len(), "nested archives unpacked");
            frontier = next;
        }
        Ok(report)
    }

    fn unpack_one(&self, archive: &Path) -> Result<Unpacked> {
        let dir = unpack_dir_for(archive);
        self.extract(archive, &dir)?;
        fs::remove_file(archive)?;
        Ok(Unpacked {
            archive: archive.to_path_buf(),
            dir,
        })
    }

    /// Unpack `archive` into `dest`, creating it. The archive is left in place.
    pub fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        let spec = self
            .tar(archive, "x")
            .arg("-C")
            .arg(dest.display().to_string());
        self.run(&spec, "unpacking", archive)
    }

    /// Pack the contents of `dir` into `archive`, compressed when its name says so.
    pub fn pack(&self, dir: &Path, archive: &Path) -> Result<()> {
        if let Some(parent) = archive.parent() {
            fs::create_dir_all(parent)?;
        }
        let spec = self
            .tar(archive, "c")
            .arg("-C")
            .arg(dir.display().to_string())
            .arg(".");
        self.run(&spec, "packing", archive)
    }

    fn run(&self, spec: &CommandSpec, verb: &str, archive: &Path) -> Result<()> {
        let out = self.runner.run(spec, &mut |_, line| debug!(target: "tar", "{line}"))?;
        if !out.success() {
            return Err(Error::execution(format!(
                "{verb} {} failed: {}",
                archive.display(),
                out.failure_detail()
            )));
        }
        Ok(())
    }

    /// `tar` with the mode flag (`x` or `c`) and `-f archive`.
    fn tar(&self, archive: &Path, mode: &str) -> CommandSpec {
        let name = archive.to_string_lossy();
        let gz = name.ends_with(".tar.gz") || name.ends_with(".tgz");
        let mut spec = CommandSpec::new("tar");
        if gz && self.plan.parallel {
            spec = spec
                .arg("-I")
                .arg(format!("pigz -p {}", self.plan.threads))
                .arg(format!("-{mode}f"));
        } else if gz {
            spec = spec.arg(format!("-{mode}zf"));
        } else {
            spec = spec.arg(format!("-{mode}f"));
        }
        spec.arg(archive.display().to_string())
    }
}

fn nested_suffix(name: &str) -> Option<&'static str> {
    NESTED_SUFFIXES.iter().copied().find(|s| name.ends_with(s) && name.len() > s.len())
}

fn find_nested(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| nested_suffix(&e.file_name().to_string_lossy()).is_some())
        .map(|e| e.into_path())
        .collect()
}

/// `a/b.tar.gz` unpacks into `a/b`.
pub fn unpack_dir_for(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match nested_suffix(&name) {
        Some(s) => &name[..name.len() - s.len()],
        None => name.as_str(),
    };
    archive.with_file_name(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::profile::{StorageMedium, SystemProfile};
    use crate::runner::CommandOutput;
    use crate::runner::testing::ScriptedRunner;

    fn plan(cores: usize, storage: StorageMedium) -> CompressionPlan {
        CompressionPlan::derive(
            &SystemProfile {
                cpu_cores: cores,
                available_memory_mb: 8192,
                storage,
            },
            Compression::Zstd,
        )
    }

    #[test]
    fn unpack_dir_strips_known_suffixes() {
        assert_eq!(unpack_dir_for(Path::new("/s/a/b.tar.gz")), PathBuf::from("/s/a/b"));
        assert_eq!(unpack_dir_for(Path::new("/s/x.tgz")), PathBuf::from("/s/x"));
        assert_eq!(unpack_dir_for(Path::new("/s/x.tar")), PathBuf::from("/s/x"));
        assert_eq!(nested_suffix(".tar"), None);
    }

    #[test]
    fn pack_mirrors_extract_flags() {
        let runner = ScriptedRunner::new(|_, _| CommandOutput::ok());
        let serial = plan(1, StorageMedium::Hdd);
        let tmp = tempfile::tempdir().expect("tempdir");
        let unpacker = Unpacker::new(&runner, &serial);
        unpacker
            .pack(Path::new("/s/addons"), &tmp.path().join("addons.tar.gz"))
            .expect("pack gz");
        unpacker
            .pack(Path::new("/s/snap"), &tmp.path().join("snap.tar"))
            .expect("pack tar");

        let parallel = plan(4, StorageMedium::Ssd);
        Unpacker::new(&runner, &parallel)
            .pack(Path::new("/s/db"), &tmp.path().join("db.tgz"))
            .expect("pack pigz");

        let calls = runner.calls();
        assert_eq!(calls[0].args[0], "-czf");
        assert_eq!(calls[0].args[2..], ["-C", "/s/addons", "."]);
        assert_eq!(calls[1].args[0], "-cf");
        assert_eq!(calls[2].args[..3], ["-I", "pigz -p 3", "-cf"]);
    }

    #[test]
    fn failed_tar_names_the_archive() {
        let runner = ScriptedRunner::new(|_, _| CommandOutput::failed(2, "tar: Unexpected EOF in archive"));
        let p = plan(1, StorageMedium::Hdd);
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = Unpacker::new(&runner, &p)
            .extract(Path::new("/backup/abc.tar"), &tmp.path().join("abc"))
            .unwrap_err();
        assert_eq!(err.kind(), "execution_error");
        assert!(err.to_string().contains("/backup/abc.tar"), "{err}");
    }
}
