//! Node service running inside each tenant VM.
//!
//! Staging finds the hotplugged disk by the serial derived from the volume
//! id, formats it on first use and mounts it at the staging path.
//! Publishing bind-mounts the staging path into the Pod.  Every step is
//! idempotent against the kernel mount table, never against local state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::mount::MsFlags;
use tracing::{debug, info, instrument, warn};

use super::device::{self, DeviceLocator};
use crate::error::CsiError;
use crate::node::CsiNode;
use crate::types::*;

/// Hotplug slots a single VM is allowed to use.
pub const DEFAULT_MAX_VOLUMES: u64 = 256;

const PROC_MOUNTS: &str = "/proc/self/mounts";

pub struct NodeService {
    /// Firmware UUID of this VM, reported as the CSI node id.
    node_id: String,
    devices: DeviceLocator,
    mounts_file: PathBuf,
    max_volumes: u64,
}

impl NodeService {
    pub fn new(node_id: impl Into<String>, devices: DeviceLocator) -> Self {
        Self {
            node_id: node_id.into(),
            devices,
            mounts_file: PathBuf::from(PROC_MOUNTS),
            max_volumes: DEFAULT_MAX_VOLUMES,
        }
    }

    /// Build a node service whose id is read from the DMI product UUID.
    pub async fn from_firmware(uuid_path: &Path, devices: DeviceLocator) -> Result<Self, CsiError> {
        let node_id = device::read_firmware_uuid(uuid_path).await?;
        info!(%node_id, "node id read from firmware");
        Ok(Self::new(node_id, devices))
    }

    /// Override the mount table consulted for idempotency checks.
    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = path.into();
        self
    }

    async fn is_mountpoint(&self, path: &str) -> bool {
        device::is_mountpoint(&self.mounts_file, path).await
    }
}

#[async_trait]
impl CsiNode for NodeService {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument("staging target path is required".into()));
        }
        if self.is_mountpoint(&req.staging_target_path).await {
            debug!(path = %req.staging_target_path, "already staged");
            return Ok(());
        }

        let serial = req.volume_id.serial();
        let dev = self.devices.find_by_serial(&serial).await?;
        let fs_type = req.volume_capability.fs_type.as_str();

        match device::existing_filesystem(&dev).await? {
            Some(existing) => debug!(dev = %dev.display(), %existing, "device already formatted"),
            None => {
                info!(dev = %dev.display(), fs_type, "formatting blank device");
                device::format_device(&dev, fs_type).await?;
            }
        }

        tokio::fs::create_dir_all(&req.staging_target_path)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: req.staging_target_path.clone(),
                reason: e.to_string(),
            })?;

        let (flags, data) = device::split_mount_flags(&req.volume_capability.mount_flags);
        nix::mount::mount(
            Some(dev.as_path()),
            req.staging_target_path.as_str(),
            Some(fs_type),
            flags,
            data.as_deref(),
        )
        .map_err(|e| CsiError::MountFailed {
            path: req.staging_target_path.clone(),
            reason: e.to_string(),
        })?;

        info!(dev = %dev.display(), path = %req.staging_target_path, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        if self.is_mountpoint(staging_target_path).await {
            nix::mount::umount(staging_target_path).map_err(|e| CsiError::UnmountFailed {
                path: staging_target_path.to_owned(),
                reason: e.to_string(),
            })?;
        } else {
            debug!(%volume_id, "staging path not mounted");
        }

        match tokio::fs::remove_dir(staging_target_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // A leftover empty directory does not block a later stage.
                warn!(%volume_id, path = staging_target_path, error = %e,
                    "failed to remove staging dir");
            }
        }

        info!(%volume_id, path = staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        // Skip the bind-mount if the target is already a mount point.
        // Without this check a second call would fail with EBUSY.
        if self.is_mountpoint(&req.target_path).await {
            debug!(target_path = %req.target_path, "target already mounted");
            return Ok(());
        }

        tokio::fs::create_dir_all(Path::new(&req.target_path))
            .await
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: e.to_string(),
            })?;

        let mut flags = MsFlags::MS_BIND;
        if req.read_only {
            flags |= MsFlags::MS_RDONLY;
        }

        nix::mount::mount(
            Some(req.staging_target_path.as_str()),
            req.target_path.as_str(),
            None::<&str>,
            flags,
            None::<&str>,
        )
        .map_err(|e| CsiError::MountFailed {
            path: req.target_path.clone(),
            reason: e.to_string(),
        })?;

        // MS_RDONLY is ignored on the initial bind; a remount enforces it.
        if req.read_only {
            nix::mount::mount(
                None::<&str>,
                req.target_path.as_str(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: req.target_path.clone(),
                reason: format!("remount read-only: {e}"),
            })?;
        }

        info!(
            target_path = %req.target_path,
            read_only = req.read_only,
            "volume published (bind-mount)",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if !self.is_mountpoint(target_path).await {
            debug!(%volume_id, "target not mounted, nothing to unpublish");
            return Ok(());
        }

        nix::mount::umount(target_path).map_err(|e| CsiError::UnmountFailed {
            path: target_path.to_owned(),
            reason: e.to_string(),
        })?;

        info!(%volume_id, %target_path, "volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: self.max_volumes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn service(tmp: &Path) -> NodeService {
        let mounts = tmp.join("mounts");
        std::fs::write(
            &mounts,
            format!(
                "/dev/vdb {0}/staged ext4 rw 0 0\n{0}/staged {0}/pod bind rw 0 0\n",
                tmp.display()
            ),
        )
        .unwrap();
        NodeService::new(
            "uuid-3",
            DeviceLocator::with_roots(tmp.join("sys"), tmp.join("by-id"), "/dev"),
        )
        .with_mounts_file(mounts)
    }

    fn stage_req(volume_id: &str, path: String) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: volume_id.into(),
            staging_target_path: path,
            volume_capability: VolumeCapability::default(),
            volume_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn node_info_reports_firmware_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        let uuid = tmp.path().join("product_uuid");
        std::fs::write(&uuid, "UUID-3\n").unwrap();

        let svc = NodeService::from_firmware(&uuid, DeviceLocator::default())
            .await
            .unwrap();
        let info = svc.get_info().await.unwrap();
        assert_eq!(info.node_id, "uuid-3");
        assert_eq!(info.max_volumes, DEFAULT_MAX_VOLUMES);
    }

    #[tokio::test]
    async fn stage_of_mounted_path_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let staged = format!("{}/staged", tmp.path().display());

        // No device with this serial exists; the mount table short-circuits.
        svc.stage_volume(stage_req("vol-1", staged)).await.unwrap();
    }

    #[tokio::test]
    async fn stage_without_device_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let target = format!("{}/fresh", tmp.path().display());

        let err = svc
            .stage_volume(stage_req("pvc-abcdefghijklmnopqrstuvwxyz", target.clone()))
            .await
            .unwrap_err();
        assert_eq!(err, CsiError::DeviceNotFound("pvc-abcdefghijklmnop".into()));
        assert!(!Path::new(&target).exists());
    }

    #[tokio::test]
    async fn stage_requires_target_path() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let err = svc.stage_volume(stage_req("vol-1", String::new())).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unstage_of_unmounted_path_removes_leftover_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let leftover = tmp.path().join("leftover");
        std::fs::create_dir(&leftover).unwrap();

        svc.unstage_volume(&VolumeId::from("vol-1"), leftover.to_str().unwrap())
            .await
            .unwrap();
        assert!(!leftover.exists());

        // Second call finds nothing and still succeeds.
        svc.unstage_volume(&VolumeId::from("vol-1"), leftover.to_str().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_of_mounted_target_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let req = NodePublishVolumeRequest {
            volume_id: "vol-1".into(),
            staging_target_path: format!("{}/staged", tmp.path().display()),
            target_path: format!("{}/pod", tmp.path().display()),
            volume_capability: VolumeCapability::default(),
            read_only: false,
        };
        svc.publish_volume(req).await.unwrap();
    }

    #[tokio::test]
    async fn unpublish_of_unmounted_target_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path());
        let target = format!("{}/other-pod", tmp.path().display());
        svc.unpublish_volume(&VolumeId::from("vol-1"), &target)
            .await
            .unwrap();
    }
}
