use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Compression;

/// Memory above which parallel compression is considered safe.
pub const PARALLEL_MEMORY_THRESHOLD_MB: u64 = 1024;

/// borg's recommended chunker parameters for small-memory hosts.
pub const SMALL_MEMORY_CHUNKER: &str = "buzhash,10,23,16,4095";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMedium {
    Ssd,
    Hdd,
    Unknown,
}

impl StorageMedium {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMedium::Ssd => "ssd",
            StorageMedium::Hdd => "hdd",
            StorageMedium::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemProfile {
    pub cpu_cores: usize,
    pub available_memory_mb: u64,
    pub storage: StorageMedium,
}

impl Default for SystemProfile {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            available_memory_mb: 0,
            storage: StorageMedium::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionPlan {
    pub algorithm: Compression,
    pub level: Option<u8>,
    pub parallel: bool,
    pub threads: usize,
    pub chunker_params: Option<String>,
    /// How many nested archives may be unpacked at once.
    pub extract_concurrency: usize,
}

impl CompressionPlan {
    pub fn derive(profile: &SystemProfile, algorithm: Compression) -> Self {
        let parallel =
            profile.cpu_cores >= 2 && profile.available_memory_mb > PARALLEL_MEMORY_THRESHOLD_MB;
        let threads = if parallel { profile.cpu_cores - 1 } else { 1 };

        let level = match algorithm {
            Compression::Zstd if parallel => Some(9),
            Compression::Zstd => Some(3),
            Compression::Zlib | Compression::Lzma if parallel => Some(9),
            Compression::Zlib | Compression::Lzma => Some(6),
            Compression::None | Compression::Lz4 => None,
        };

        let chunker_params = (profile.available_memory_mb <= PARALLEL_MEMORY_THRESHOLD_MB)
            .then(|| SMALL_MEMORY_CHUNKER.to_string());

        // Rotational media get no concurrent random reads.
        let extract_concurrency = match profile.storage {
            StorageMedium::Ssd => threads,
            StorageMedium::Hdd | StorageMedium::Unknown => 1,
        };

        Self {
            algorithm,
            level,
            parallel,
            threads,
            chunker_params,
            extract_concurrency,
        }
    }

    /// Value for `borg create --compression`.
    pub fn compression_spec(&self) -> String {
        match self.level {
            Some(l) if self.algorithm.takes_level() => format!("{},{l}", self.algorithm),
            _ => self.algorithm.to_string(),
        }
    }
}

/// Where the probes look. Overridable so tests can point at fixture files.
#[derive(Debug, Clone)]
pub struct SystemProfiler {
    pub meminfo: PathBuf,
    pub mounts: PathBuf,
    pub sys_block: PathBuf,
    pub root: PathBuf,
    pub cpu_cores: Option<usize>,
}

impl Default for SystemProfiler {
    fn default() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
            mounts: PathBuf::from("/proc/mounts"),
            sys_block: PathBuf::from("/sys/block"),
            root: PathBuf::from("/"),
            cpu_cores: None,
        }
    }
}

impl SystemProfiler {
    /// Best-effort snapshot. Never fails; unknown values fall back to conservative defaults.
    pub fn profile(&self) -> SystemProfile {
        let defaults = SystemProfile::default();
        let cpu_cores = self.cpu_cores.unwrap_or_else(num_cpus::get).max(1);
        let available_memory_mb = read_available_memory_mb(&self.meminfo)
            .unwrap_or(defaults.available_memory_mb);
        let storage = self.probe_storage();
        let profile = SystemProfile {
            cpu_cores,
            available_memory_mb,
            storage,
        };
        debug!(
            cores = profile.cpu_cores,
            memory_mb = profile.available_memory_mb,
            storage = profile.storage.as_str(),
            "system profile"
        );
        profile
    }

    fn probe_storage(&self) -> StorageMedium {
        let Some(device) = root_device(&self.mounts, &self.root) else {
            warn!("could not determine root device, assuming slow storage");
            return StorageMedium::Unknown;
        };
        let name = device.rsplit('/').next().unwrap_or_default().to_string();
        if name.starts_with("mmcblk") {
            return StorageMedium::Hdd;
        }
        let Some(disk) = parent_disk(&self.sys_block, &name) else {
            return StorageMedium::Unknown;
        };
        match fs::read_to_string(self.sys_block.join(&disk).join("queue/rotational")) {
            Ok(s) if s.trim() == "0" => StorageMedium::Ssd,
            Ok(s) if s.trim() == "1" => StorageMedium::Hdd,
            _ => StorageMedium::Unknown,
        }
    }
}

fn read_available_memory_mb(meminfo: &Path) -> Option<u64> {
    let body = fs::read_to_string(meminfo).ok()?;
    let line = body
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .or_else(|| body.lines().find(|l| l.starts_with("MemFree:")))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

fn root_device(mounts: &Path, root: &Path) -> Option<String> {
    let body = fs::read_to_string(mounts).ok()?;
    let root = root.to_str()?;
    body.lines()
        .filter_map(|l| {
            let mut it = l.split_whitespace();
            Some((it.next()?, it.next()?))
        })
        .filter(|(dev, mnt)| *mnt == root && dev.starts_with("/dev/"))
        .last()
        .map(|(dev, _)| dev.to_string())
}

// Partitions (sda1, nvme0n1p2) have no queue/ of their own; walk up to the disk.
fn parent_disk(sys_block: &Path, name: &str) -> Option<String> {
    if sys_block.join(name).join("queue").is_dir() {
        return Some(name.to_string());
    }
    let entries = fs::read_dir(sys_block).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|disk| name.starts_with(disk.as_str()) && name != disk)
        .max_by_key(|disk| disk.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(cores: usize, mem: u64, storage: StorageMedium) -> SystemProfile {
        SystemProfile {
            cpu_cores: cores,
            available_memory_mb: mem,
            storage,
        }
    }

    #[test]
    fn parallel_needs_cores_and_memory() {
        let p = CompressionPlan::derive(&profile(4, 4096, StorageMedium::Ssd), Compression::Zstd);
        assert!(p.parallel);
        assert_eq!(p.threads, 3);
        assert_eq!(p.compression_spec(), "zstd,9");
        assert_eq!(p.extract_concurrency, 3);
        assert!(p.chunker_params.is_none());

        let p = CompressionPlan::derive(&profile(1, 8192, StorageMedium::Ssd), Compression::Zstd);
        assert!(!p.parallel);
        assert_eq!(p.threads, 1);

        let p = CompressionPlan::derive(&profile(8, 1024, StorageMedium::Ssd), Compression::Lzma);
        assert!(!p.parallel);
        assert_eq!(p.compression_spec(), "lzma,6");
        assert_eq!(p.chunker_params.as_deref(), Some(SMALL_MEMORY_CHUNKER));
    }

    #[test]
    fn storage_only_changes_io_hints() {
        let ssd = CompressionPlan::derive(&profile(4, 4096, StorageMedium::Ssd), Compression::Lz4);
        let hdd = CompressionPlan::derive(&profile(4, 4096, StorageMedium::Hdd), Compression::Lz4);
        assert_eq!(ssd.parallel, hdd.parallel);
        assert_eq!(ssd.compression_spec(), hdd.compression_spec());
        assert_eq!(ssd.compression_spec(), "lz4");
        assert_eq!(hdd.extract_concurrency, 1);
    }

    #[test]
    fn missing_probes_fall_back_to_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let profiler = SystemProfiler {
            meminfo: tmp.path().join("missing-meminfo"),
            mounts: tmp.path().join("missing-mounts"),
            sys_block: tmp.path().join("missing-block"),
            root: PathBuf::from("/"),
            cpu_cores: Some(0),
        };
        let p = profiler.profile();
        assert_eq!(p, SystemProfile::default());
    }

    #[test]
    fn reads_meminfo_and_rotational_flag() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let meminfo = tmp.path().join("meminfo");
        fs::write(
            &meminfo,
            "MemTotal:        8000000 kB\nMemFree:  100 kB\nMemAvailable:    2097152 kB\n",
        )
        .expect("write meminfo");
        let mounts = tmp.path().join("mounts");
        fs::write(
            &mounts,
            "proc /proc proc rw 0 0\n/dev/sda2 / ext4 rw 0 0\n",
        )
        .expect("write mounts");
        let block = tmp.path().join("block");
        fs::create_dir_all(block.join("sda/queue")).expect("mkdir");
        fs::write(block.join("sda/queue/rotational"), "1\n").expect("write rotational");

        let profiler = SystemProfiler {
            meminfo,
            mounts,
            sys_block: block,
            root: PathBuf::from("/"),
            cpu_cores: Some(4),
        };
        let p = profiler.profile();
        assert_eq!(p.available_memory_mb, 2048);
        assert_eq!(p.storage, StorageMedium::Hdd);
        assert_eq!(p.cpu_cores, 4);
    }

    #[test]
    fn sd_cards_count_as_slow() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mounts = tmp.path().join("mounts");
        fs::write(&mounts, "/dev/mmcblk0p2 / ext4 rw 0 0\n").expect("write mounts");
        let profiler = SystemProfiler {
            mounts,
            meminfo: tmp.path().join("none"),
            sys_block: tmp.path().join("none"),
            root: PathBuf::from("/"),
            cpu_cores: Some(2),
        };
        assert_eq!(profiler.profile().storage, StorageMedium::Hdd);
    }
}
