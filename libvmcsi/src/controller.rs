//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: creation
//! and deletion of the backing disk images, and attaching them to / detaching
//! them from the VMs that back tenant nodes.  The remaining CSI controller
//! RPCs are part of the trait so that callers always get a typed
//! [`CsiError::Unimplemented`] rather than a missing method.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest,
    CreateVolumeRequest, Volume, VolumeCapability, VolumeId,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// Idempotent by `req.name`: a second call with the same name returns the
    /// same volume id without provisioning anything.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to the VM backing `req.node_id`.
    async fn publish_volume(&self, req: ControllerPublishVolumeRequest) -> Result<(), CsiError>;

    /// Detach a volume from the VM backing `req.node_id`.
    async fn unpublish_volume(&self, req: ControllerUnpublishVolumeRequest)
    -> Result<(), CsiError>;

    /// Controller RPCs this plugin supports, in a stable order.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    async fn validate_volume_capabilities(
        &self,
        _volume_id: &VolumeId,
        _capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        Err(CsiError::Unimplemented("ValidateVolumeCapabilities".into()))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        Err(CsiError::Unimplemented("ListVolumes".into()))
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented("GetCapacity".into()))
    }

    async fn create_snapshot(&self, _source: &VolumeId, _name: &str) -> Result<String, CsiError> {
        Err(CsiError::Unimplemented("CreateSnapshot".into()))
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented("DeleteSnapshot".into()))
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, CsiError> {
        Err(CsiError::Unimplemented("ListSnapshots".into()))
    }

    async fn expand_volume(
        &self,
        _volume_id: &VolumeId,
        _required_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented("ControllerExpandVolume".into()))
    }
}
