//! Node role, served from inside each tenant VM.
//!
//! The controller has already hotplugged the disk; the node side only
//! deals with the local kernel: locate the block device by its serial,
//! put a filesystem on it, and expose it to Pods through mounts.  Staging
//! happens once per VM, publishing once per Pod.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId};

#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Mount the hotplugged disk at `req.staging_target_path`, formatting it
    /// first when it carries no filesystem.  A path that is already a mount
    /// point is left alone.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Undo [`CsiNode::stage_volume`].  Succeeds when nothing is mounted.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Bind-mount the staging path to `req.target_path`, read-only when
    /// requested.  Repeating the call for a mounted target succeeds.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Remove the Pod's bind mount; an unmounted target is not an error.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// The VM's firmware UUID, which is also how the controller finds the
    /// VM backing this node, plus the hotplug slot limit.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
