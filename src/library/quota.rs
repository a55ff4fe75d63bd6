use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::Disks;

/// Totals across every offline episode record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub episode_count: usize,
    /// Sum of `file_size` over all offline episodes
    pub total_bytes: u64,
}

/// Storage headroom as reported by the host.
///
/// `available` and `total` are 0 when the host does not expose them; they are
/// never estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuota {
    /// Bytes held by offline episodes
    pub used: u64,
    pub available: u64,
    pub total: u64,
}

impl StorageQuota {
    pub fn is_known(&self) -> bool {
        self.total > 0
    }
}

/// Free and total space of the volume holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub available: u64,
    pub total: u64,
}

/// Host-specific lookup of disk space
pub trait QuotaSource: Send + Sync {
    /// `None` when the host cannot tell
    fn disk_space(&self, path: &Path) -> Option<DiskSpace>;
}

/// Reads the mounted volumes through sysinfo and picks the one with the
/// longest mount point containing the library
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemQuota;

impl QuotaSource for SystemQuota {
    fn disk_space(&self, path: &Path) -> Option<DiskSpace> {
        let target = nearest_existing_path(path);
        let target = std::fs::canonicalize(&target).unwrap_or(target);
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| DiskSpace {
                available: disk.available_space(),
                total: disk.total_space(),
            })
    }
}

/// For hosts without any storage estimate
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownQuota;

impl QuotaSource for UnknownQuota {
    fn disk_space(&self, _path: &Path) -> Option<DiskSpace> {
        None
    }
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}
