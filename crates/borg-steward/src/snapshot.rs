//! Supervisor snapshots staged as plain trees so borg can deduplicate their contents.
//!
//! A snapshot `{slug}.tar` is unpacked into a directory named after its slug, and every
//! nested archive in it is unpacked too. A manifest in that directory lists the nested
//! archives in unpack order, so a restore can pack them back up innermost first and
//! rebuild a tarball the supervisor accepts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::unpack::{MAX_NESTED_DEPTH, Unpacker, unpack_dir_for};

/// Lists the nested archives unpacked inside a staged snapshot, one relative path per line.
pub const PACKED_MANIFEST: &str = ".borg-steward-packed";

/// Where the supervisor keeps `{slug}.tar`.
pub fn snapshot_tarball(backup_dir: &Path, slug: &str) -> PathBuf {
    backup_dir.join(format!("{slug}.tar"))
}

/// Unpack `tarball` into `dest` and expand the archives nested in it.
pub fn stage_snapshot(unpacker: &Unpacker<'_>, tarball: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    unpacker.extract(tarball, dest)?;
    let nested = unpacker.unpack_nested(dest)?;
    for p in &nested.depth_limited {
        warn!(path = %p.display(), depth = MAX_NESTED_DEPTH, "nested archive left packed");
    }

    let mut manifest = String::new();
    for u in &nested.unpacked {
        let rel = u.archive.strip_prefix(dest).unwrap_or(&u.archive);
        manifest.push_str(&rel.to_string_lossy());
        manifest.push('\n');
    }
    fs::write(dest.join(PACKED_MANIFEST), manifest)?;
    info!(
        snapshot = %dest.display(),
        nested = nested.unpacked.len(),
        "supervisor snapshot staged"
    );
    Ok(())
}

/// The shallowest staged snapshot under `root`.
pub fn find_staged(root: &Path) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == PACKED_MANIFEST)
        .min_by_key(|e| e.depth())
        .and_then(|e| e.path().parent().map(Path::to_path_buf))
}

/// Pack a staged snapshot back into `{backup_dir}/{slug}.tar`, the slug being the
/// directory name. Returns the slug.
pub fn repack(unpacker: &Unpacker<'_>, staged: &Path, backup_dir: &Path) -> Result<String> {
    let slug = staged
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::execution(format!("{} is not a snapshot directory", staged.display())))?;
    let manifest_path = staged.join(PACKED_MANIFEST);
    let manifest = fs::read_to_string(&manifest_path)?;

    // Innermost first, so each outer archive picks up its repacked children.
    for rel in manifest.lines().rev().filter(|l| !l.trim().is_empty()) {
        let archive = staged.join(rel);
        let dir = unpack_dir_for(&archive);
        if !dir.is_dir() {
            return Err(Error::execution(format!(
                "staged snapshot {slug} lacks {}",
                dir.display()
            )));
        }
        unpacker.pack(&dir, &archive)?;
        fs::remove_dir_all(&dir)?;
    }
    fs::remove_file(&manifest_path)?;

    let tarball = snapshot_tarball(backup_dir, &slug);
    unpacker.pack(staged, &tarball)?;
    info!(slug = %slug, tarball = %tarball.display(), "supervisor snapshot rebuilt");
    Ok(slug)
}
