use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::runner::{CommandRunner, CommandSpec};

pub const DEFAULT_KEY_COMMENT: &str = "root@local-borg-backup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshIdentity {
    pub private_key: PathBuf,
    pub public_key: String,
    pub key_type: String,
    /// `SHA256:<unpadded base64>`, as `ssh-keygen -l` prints it.
    pub fingerprint: String,
    /// True when this run generated the pair.
    pub created: bool,
}

pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut s: OsString = private_key.as_os_str().to_owned();
    s.push(".pub");
    PathBuf::from(s)
}

/// Parse an OpenSSH public key line and compute its SHA-256 fingerprint.
pub fn fingerprint(public_key_line: &str) -> Result<(String, String)> {
    let mut parts = public_key_line.split_whitespace();
    let (Some(key_type), Some(b64)) = (parts.next(), parts.next()) else {
        return Err(Error::identity("public key is not in OpenSSH format"));
    };
    let blob = STANDARD
        .decode(b64)
        .map_err(|e| Error::identity(format!("public key is not valid base64: {e}")))?;

    let embedded_type = read_ssh_string(&blob, 0)
        .map(|(s, _)| s)
        .ok_or_else(|| Error::identity("public key blob is truncated"))?;
    if embedded_type != key_type.as_bytes() {
        return Err(Error::identity(format!(
            "public key type '{key_type}' does not match its blob"
        )));
    }
    if key_type == "ssh-ed25519" {
        validate_ed25519_blob(&blob)?;
    }

    let digest = Sha256::digest(&blob);
    Ok((
        key_type.to_string(),
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)),
    ))
}

fn read_ssh_string(buf: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let len_bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let start = at + 4;
    let data = buf.get(start..start + len)?;
    Some((data, start + len))
}

fn validate_ed25519_blob(blob: &[u8]) -> Result<()> {
    let (_, next) = read_ssh_string(blob, 0)
        .ok_or_else(|| Error::identity("ed25519 key blob is truncated"))?;
    let (point, end) = read_ssh_string(blob, next)
        .ok_or_else(|| Error::identity("ed25519 key blob is truncated"))?;
    if end != blob.len() {
        return Err(Error::identity("ed25519 key blob has trailing data"));
    }
    let bytes: [u8; 32] = point
        .try_into()
        .map_err(|_| Error::identity(format!("ed25519 key has {} bytes, expected 32", point.len())))?;
    ed25519_dalek::VerifyingKey::from_bytes(&bytes)
        .map_err(|e| Error::identity(format!("ed25519 public key is invalid: {e}")))?;
    Ok(())
}

/// Owns the on-disk key pair used for the repository connection.
pub struct SshIdentityManager<'a> {
    key_path: PathBuf,
    comment: String,
    runner: &'a dyn CommandRunner,
}

impl<'a> SshIdentityManager<'a> {
    pub fn new(key_path: impl Into<PathBuf>, runner: &'a dyn CommandRunner) -> Self {
        Self {
            key_path: key_path.into(),
            comment: DEFAULT_KEY_COMMENT.into(),
            runner,
        }
    }

    /// Load the key pair, generating it first when absent. Never rotates or deletes keys.
    pub fn ensure_identity(&self) -> Result<SshIdentity> {
        let pub_path = public_key_path(&self.key_path);
        let private_exists = self.key_path.is_file();
        let public_exists = pub_path.is_file();

        match (private_exists, public_exists) {
            (true, true) => {
                let identity = self.load(false)?;
                info!(
                    "Using existing SSH key with fingerprint: {} ({})",
                    identity.fingerprint, identity.key_type
                );
                Ok(identity)
            }
            (true, false) => {
                warn!(
                    "public key {} is missing; deriving it from the private key",
                    pub_path.display()
                );
                self.derive_public_key(&pub_path)?;
                self.load(false)
            }
            (false, true) => Err(Error::identity(format!(
                "found {} without its private key {}; refusing to replace an authorized key",
                pub_path.display(),
                self.key_path.display()
            ))),
            (false, false) => {
                self.generate()?;
                let identity = self.load(true)?;
                info!("Your ssh key to use for borg backup host");
                info!("************ SNIP **********************");
                info!("{}", identity.public_key);
                info!("************ SNIP **********************");
                info!("fingerprint: {}", identity.fingerprint);
                Ok(identity)
            }
        }
    }

    fn load(&self, created: bool) -> Result<SshIdentity> {
        let pub_path = public_key_path(&self.key_path);
        let public_key = fs::read_to_string(&pub_path)
            .map_err(|e| Error::identity(format!("failed to read {}: {e}", pub_path.display())))?
            .trim()
            .to_string();
        let (key_type, fingerprint) = fingerprint(&public_key)?;
        Ok(SshIdentity {
            private_key: self.key_path.clone(),
            public_key,
            key_type,
            fingerprint,
            created,
        })
    }

    fn generate(&self) -> Result<()> {
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::identity(format!("failed to create key dir {}: {e}", parent.display()))
            })?;
            if let Err(e) = restrict_key_dir(parent) {
                warn!(path = %parent.display(), error = %e, "could not restrict key directory to 0700");
            }
        }

        let spec = CommandSpec::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C"])
            .arg(self.comment.clone())
            .arg("-f")
            .arg(self.key_path.display().to_string());
        let out = self
            .runner
            .run(&spec, &mut |_, line| info!("[ssh-keygen] {line}"))
            .map_err(|e| Error::identity(format!("ssh-keygen failed to start: {e}")))?;
        if !out.success() {
            return Err(Error::identity(format!(
                "ssh-keygen failed: {}",
                out.failure_detail()
            )));
        }
        if !self.key_path.is_file() || !public_key_path(&self.key_path).is_file() {
            return Err(Error::identity(format!(
                "ssh-keygen reported success but {} was not written",
                self.key_path.display()
            )));
        }
        Ok(())
    }

    fn derive_public_key(&self, pub_path: &Path) -> Result<()> {
        let spec = CommandSpec::new("ssh-keygen")
            .args(["-y", "-f"])
            .arg(self.key_path.display().to_string())
            .capture_stdout();
        let out = self
            .runner
            .run(&spec, &mut |_, _| {})
            .map_err(|e| Error::identity(format!("ssh-keygen failed to start: {e}")))?;
        if !out.success() {
            return Err(Error::identity(format!(
                "could not derive public key: {}",
                out.failure_detail()
            )));
        }
        let line = format!("{} {}\n", out.stdout.trim(), self.comment);
        fs::write(pub_path, line)
            .map_err(|e| Error::identity(format!("failed to write {}: {e}", pub_path.display())))
    }
}

#[cfg(unix)]
fn restrict_key_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_key_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
