//! Local block-device discovery and mount helpers for the node service.
//!
//! A hotplugged disk shows up in the guest with the serial the controller
//! derived from the volume id.  virtio-blk exposes it in
//! `/sys/block/<dev>/serial`; SCSI disks only through the udev links under
//! `/dev/disk/by-id`, so both are searched.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::debug;

use crate::error::CsiError;

/// Filesystems the node service will create on a blank disk.
pub const SUPPORTED_FS_TYPES: [&str; 3] = ["ext4", "ext3", "xfs"];

/// Finds block devices by serial number.
#[derive(Debug, Clone)]
pub struct DeviceLocator {
    sys_block: PathBuf,
    by_id: PathBuf,
    dev_root: PathBuf,
}

impl Default for DeviceLocator {
    fn default() -> Self {
        Self::with_roots("/sys/block", "/dev/disk/by-id", "/dev")
    }
}

impl DeviceLocator {
    pub fn with_roots(
        sys_block: impl Into<PathBuf>,
        by_id: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sys_block: sys_block.into(),
            by_id: by_id.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Return the device node whose serial equals `serial`.
    pub async fn find_by_serial(&self, serial: &str) -> Result<PathBuf, CsiError> {
        if serial.is_empty() {
            return Err(CsiError::InvalidArgument("empty device serial".into()));
        }
        if let Some(dev) = self.scan_sys_block(serial).await? {
            return Ok(dev);
        }
        if let Some(dev) = self.scan_by_id(serial).await? {
            return Ok(dev);
        }
        Err(CsiError::DeviceNotFound(serial.to_owned()))
    }

    async fn scan_sys_block(&self, serial: &str) -> Result<Option<PathBuf>, CsiError> {
        let Some(mut dir) = read_dir_if_exists(&self.sys_block).await? else {
            return Ok(None);
        };
        while let Some(entry) = dir.next_entry().await.map_err(CsiError::internal)? {
            let Ok(found) = tokio::fs::read_to_string(entry.path().join("serial")).await else {
                continue;
            };
            if found.trim() == serial {
                let dev = self.dev_root.join(entry.file_name());
                debug!(%serial, dev = %dev.display(), "device found via sysfs");
                return Ok(Some(dev));
            }
        }
        Ok(None)
    }

    async fn scan_by_id(&self, serial: &str) -> Result<Option<PathBuf>, CsiError> {
        let Some(mut dir) = read_dir_if_exists(&self.by_id).await? else {
            return Ok(None);
        };
        while let Some(entry) = dir.next_entry().await.map_err(CsiError::internal)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !by_id_matches(name, serial) {
                continue;
            }
            let link = entry.path();
            let dev = tokio::fs::canonicalize(&link).await.unwrap_or(link);
            debug!(%serial, dev = %dev.display(), "device found via by-id link");
            return Ok(Some(dev));
        }
        Ok(None)
    }
}

async fn read_dir_if_exists(path: &Path) -> Result<Option<tokio::fs::ReadDir>, CsiError> {
    match tokio::fs::read_dir(path).await {
        Ok(dir) => Ok(Some(dir)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CsiError::Internal(format!("read_dir {}: {e}", path.display()))),
    }
}

/// udev names disks `<bus>-<model>_<serial>` or `<bus>-<serial>`; partitions
/// get a `-partN` suffix and are skipped.
fn by_id_matches(name: &str, serial: &str) -> bool {
    if name.contains("-part") {
        return false;
    }
    name.strip_suffix(serial)
        .is_some_and(|prefix| prefix.ends_with('-') || prefix.ends_with('_'))
}

/// Read the VM firmware UUID exposed through DMI.
pub async fn read_firmware_uuid(path: &Path) -> Result<String, CsiError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CsiError::Internal(format!("read {}: {e}", path.display())))?;
    let uuid = raw.trim().to_ascii_lowercase();
    if uuid.is_empty() {
        return Err(CsiError::Internal(format!("{} is empty", path.display())));
    }
    Ok(uuid)
}

/// Return `true` if `path` is listed as a mount point in `mounts_file`
/// (normally `/proc/self/mounts`).
///
/// The mounts file uses octal escapes (`\040` for space, etc.).  CSI target
/// paths must not contain whitespace, so direct comparison is safe.
pub async fn is_mountpoint(mounts_file: &Path, path: &str) -> bool {
    let contents = match tokio::fs::read_to_string(mounts_file).await {
        Ok(c) => c,
        Err(_) => return false,
    };
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

/// Split CSI mount flags into kernel mount flags and filesystem data.
pub fn split_mount_flags(flags: &[String]) -> (MsFlags, Option<String>) {
    let mut ms = MsFlags::empty();
    let mut data = Vec::new();
    for flag in flags {
        match flag.as_str() {
            "ro" => ms |= MsFlags::MS_RDONLY,
            "noatime" => ms |= MsFlags::MS_NOATIME,
            "nodiratime" => ms |= MsFlags::MS_NODIRATIME,
            "nodev" => ms |= MsFlags::MS_NODEV,
            "noexec" => ms |= MsFlags::MS_NOEXEC,
            "nosuid" => ms |= MsFlags::MS_NOSUID,
            "" | "defaults" | "rw" => {}
            other => data.push(other),
        }
    }
    let data = (!data.is_empty()).then(|| data.join(","));
    (ms, data)
}

/// Filesystem currently on `device`, `None` when the device is blank.
pub async fn existing_filesystem(device: &Path) -> Result<Option<String>, CsiError> {
    let output = tokio::process::Command::new("blkid")
        .args(["-p", "-s", "TYPE", "-o", "value"])
        .arg(device)
        .output()
        .await
        .map_err(|e| CsiError::Internal(format!("blkid {}: {e}", device.display())))?;

    match output.status.code() {
        Some(0) => {
            let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            Ok((!fs.is_empty()).then_some(fs))
        }
        // blkid exits 2 when no filesystem signature is found.
        Some(2) => Ok(None),
        code => Err(CsiError::Internal(format!(
            "blkid {} exited with {code:?}: {}",
            device.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

/// Create a `fs_type` filesystem on `device`.
pub async fn format_device(device: &Path, fs_type: &str) -> Result<(), CsiError> {
    if !SUPPORTED_FS_TYPES.contains(&fs_type) {
        return Err(CsiError::InvalidArgument(format!(
            "unsupported filesystem {fs_type}"
        )));
    }
    let mut cmd = tokio::process::Command::new(format!("mkfs.{fs_type}"));
    if fs_type.starts_with("ext") {
        cmd.arg("-F");
    }
    let output = cmd
        .arg(device)
        .output()
        .await
        .map_err(|e| CsiError::Internal(format!("mkfs.{fs_type}: {e}")))?;
    if !output.status.success() {
        return Err(CsiError::Internal(format!(
            "mkfs.{fs_type} {} failed: {}",
            device.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
