use nix::sys::statvfs::statvfs;
use std::path::Path;

use crate::storage::StorageError;

/// Free space is discounted by 5% before admission to leave headroom for
/// journalling and inode growth on the host filesystem.
const FREE_SPACE_DISCOUNT: f64 = 0.95;

/// Capacity snapshot for the filesystem backing the namespace root.
#[derive(Debug, Clone)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    /// Total inodes; zero on filesystems that allocate inodes dynamically.
    pub files: u64,
    pub files_free: u64,
    pub fs_type: String,
}

pub fn disk_usage(path: &Path) -> Result<DiskUsage, StorageError> {
    let vfs = statvfs(path).map_err(|errno| StorageError::Io(errno.into()))?;
    let frsize = vfs.fragment_size() as u64;
    Ok(DiskUsage {
        total: (vfs.blocks() as u64).saturating_mul(frsize),
        free: (vfs.blocks_available() as u64).saturating_mul(frsize),
        files: vfs.files() as u64,
        files_free: vfs.files_free() as u64,
        fs_type: fs_type_name(path),
    })
}

#[cfg(target_os = "linux")]
fn fs_type_name(path: &Path) -> String {
    use nix::sys::statfs::{self, statfs};

    let Ok(fs) = statfs(path) else {
        return "unknown".to_string();
    };
    let t = fs.filesystem_type();
    if t == statfs::NFS_SUPER_MAGIC {
        "nfs"
    } else if t == statfs::TMPFS_MAGIC {
        "tmpfs"
    } else if t == statfs::EXT4_SUPER_MAGIC {
        "ext4"
    } else if t == statfs::XFS_SUPER_MAGIC {
        "xfs"
    } else if t == statfs::BTRFS_SUPER_MAGIC {
        "btrfs"
    } else {
        "unknown"
    }
    .to_string()
}

#[cfg(not(target_os = "linux"))]
fn fs_type_name(_path: &Path) -> String {
    "unknown".to_string()
}

/// Admission guard consulted before every put. Fails with `DiskFull` when
/// discounted free space falls at or below `min_free_space`, or when the
/// filesystem reports a finite inode total, is not exempt, and free inodes
/// fall at or below `min_free_inodes`.
pub fn check_disk_free(
    path: &Path,
    min_free_space: u64,
    min_free_inodes: u64,
    inode_exempt_fs_types: &[String],
) -> Result<(), StorageError> {
    let usage = disk_usage(path)?;

    let available = (usage.free as f64 * FREE_SPACE_DISCOUNT) as u64;
    if available <= min_free_space {
        return Err(StorageError::DiskFull);
    }

    // Some filesystems (CephFS, various network mounts) allocate inodes
    // from free space and report a zero or meaningless total; only enforce
    // the inode floor when the total is real and the type is not exempt.
    let exempt = inode_exempt_fs_types
        .iter()
        .any(|t| t.eq_ignore_ascii_case(&usage.fs_type));
    if usage.files != 0 && !exempt && usage.files_free <= min_free_inodes {
        return Err(StorageError::DiskFull);
    }

    Ok(())
}
