//! Wire envelope for the CSI RPCs.
//!
//! Requests and responses share one serde enum so that a stream can be
//! decoded without knowing in advance which RPC it carries.  Errors travel
//! as [`CsiMessage::Error`] and keep their variant, so the caller can still
//! tell "not found" from "unimplemented" after the round trip.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// One request or one response.  A bi-stream carries exactly one of each,
/// request first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Create a new volume (Controller).
    CreateVolume(CreateVolumeRequest),
    /// Delete a volume (Controller).
    DeleteVolume(VolumeId),
    /// Attach a volume to a node's VM (Controller).
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    /// Detach a volume from a node's VM (Controller).
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    /// Query supported controller RPCs (Controller).
    ControllerGetCapabilities,
    /// List all known volumes (Controller).
    ListVolumes,
    /// Query remaining capacity (Controller).
    GetCapacity,
    /// Validate volume capabilities (Controller).
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    /// Snapshot a volume (Controller).
    CreateSnapshot {
        source_volume_id: VolumeId,
        name: String,
    },
    /// Delete a snapshot (Controller).
    DeleteSnapshot(String),
    /// List snapshots (Controller).
    ListSnapshots,
    /// Grow a volume (Controller).
    ControllerExpandVolume {
        volume_id: VolumeId,
        required_bytes: u64,
    },

    /// Stage (format and mount) a volume at a global path (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Unstage a previously staged volume (Node).
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Publish (bind-mount) a staged volume into a Pod (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Unpublish a previously published volume (Node).
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,
    /// Query node info (Node).
    GetNodeInfo,

    // ----- Responses -------------------------------------------------------
    /// A volume was successfully created.
    VolumeCreated(Volume),
    /// Supported controller RPCs.
    ControllerCapabilities(Vec<ControllerCapability>),
    /// A list of volumes.
    VolumeList(Vec<Volume>),
    /// Available capacity in bytes.
    Capacity(u64),
    /// Whether the requested capabilities are valid.
    CapabilitiesValid(bool),
    /// Id of a created snapshot.
    SnapshotCreated(String),
    /// Snapshot ids.
    SnapshotList(Vec<String>),
    /// New capacity of an expanded volume.
    VolumeExpanded(u64),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

/// The request half of a bi-stream: one request message plus how long the
/// caller is still willing to wait for its answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsiRequest {
    pub message: CsiMessage,
    /// Caller budget in milliseconds.  Absent means the server's own cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CsiRequest {
    pub fn new(message: CsiMessage) -> Self {
        Self {
            message,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Deadline to enforce: the tighter of the caller's budget and `cap`.
    pub fn effective_timeout(&self, cap: Duration) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .map_or(cap, |caller| caller.min(cap))
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({})", id),
            Self::ControllerPublishVolume(req) => write!(
                f,
                "ControllerPublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerUnpublishVolume(req) => write!(
                f,
                "ControllerUnpublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::ListVolumes => f.write_str("ListVolumes"),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({})", volume_id)
            }
            Self::CreateSnapshot {
                source_volume_id, ..
            } => write!(f, "CreateSnapshot({})", source_volume_id),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({})", id),
            Self::ListSnapshots => f.write_str("ListSnapshots"),
            Self::ControllerExpandVolume { volume_id, .. } => {
                write!(f, "ControllerExpandVolume({})", volume_id)
            }
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({})", volume_id)
            }
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::Capacity(c) => write!(f, "Capacity({})", c),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({})", v),
            Self::SnapshotCreated(id) => write!(f, "SnapshotCreated({})", id),
            Self::SnapshotList(ids) => write!(f, "SnapshotList(count={})", ids.len()),
            Self::VolumeExpanded(bytes) => write!(f, "VolumeExpanded({})", bytes),
            Self::PluginInfoResponse(info) => {
                write!(f, "PluginInfo(name={})", info.name)
            }
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}
