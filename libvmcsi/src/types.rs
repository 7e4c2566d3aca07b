//! Data model shared by the CSI traits, the services and the wire envelope.
//!
//! Also home to the derivation rules that tie a volume id to its disk image,
//! hotplug disk name and device serial.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Storage-class parameter naming the storage class used in the infra cluster.
pub const PARAM_INFRA_STORAGE_CLASS: &str = "infraStorageClassName";
/// Storage-class parameter (and volume-context key) carrying the disk bus.
pub const PARAM_BUS: &str = "bus";
/// Storage-class parameter for thin provisioning.  Parsed but not acted upon.
pub const PARAM_THIN_PROVISIONING: &str = "thinProvisioning";

/// Maximum length of a disk serial number as exposed by the VM firmware.
pub const MAX_SERIAL_LEN: usize = 20;

/// Longest name the infra API server accepts for a DataVolume.
pub const MAX_OBJECT_NAME_LEN: usize = 253;

/// Whether `name` is a DNS-1123 subdomain, the form every infra object name
/// must take: dot-separated labels of lowercase alphanumerics and `-`, each
/// starting and ending alphanumeric, at most [`MAX_OBJECT_NAME_LEN`] long.
pub fn is_object_name(name: &str) -> bool {
    name.len() <= MAX_OBJECT_NAME_LEN
        && name.split('.').all(|label| {
            let bytes = label.as_bytes();
            let edges_ok = matches!(
                (bytes.first(), bytes.last()),
                (Some(first), Some(last))
                    if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric()
            );
            edges_ok
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        })
}

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
///
/// The id is the name of the backing disk image in the infra cluster, so the
/// hotplug disk name and serial can always be re-derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Name of the infra-cluster disk image backing this volume.
    pub fn disk_image_name(&self) -> &str {
        &self.0
    }

    /// Name of the hotplug disk on the VM: `disk-<disk image name>`.
    pub fn disk_name(&self) -> String {
        format!("disk-{}", self.disk_image_name())
    }

    /// Serial number presented to the guest, the first
    /// [`MAX_SERIAL_LEN`] characters of the id.
    pub fn serial(&self) -> String {
        self.0.chars().take(MAX_SERIAL_LEN).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Access modes as they appear on PVC specs.  The driver only ever
/// requests [`AccessMode::ReadWriteOnce`], but DataVolumes listed from the
/// infra namespace may carry any of them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem created on the hotplugged disk when it is first staged.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
}

fn default_fs_type() -> String {
    "ext4".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            mount_flags: Vec::new(),
            fs_type: default_fs_type(),
        }
    }
}

/// Capacity bounds requested for a new volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    /// Minimum size the volume must have, in bytes.
    pub required_bytes: u64,
    /// Upper bound in bytes; `0` means unbounded.
    #[serde(default)]
    pub limit_bytes: u64,
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// A provisioned volume as reported back to the container orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from CreateVolume to the publish calls.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Controller RPCs advertised through `ControllerGetCapabilities`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-assigned name, stable across retries.  Becomes the volume id.
    pub name: String,
    /// Desired capacity.
    #[serde(default)]
    pub capacity_range: CapacityRange,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters (`infraStorageClassName`, `bus`, ...).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to attach a volume to the VM backing a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    /// Volume to attach.
    pub volume_id: VolumeId,
    /// CSI node id reported by the node service (a VM firmware UUID).
    pub node_id: String,
    /// Capability the volume is published with.
    #[serde(default)]
    pub volume_capability: VolumeCapability,
    /// Whether the volume is published read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Context returned from `CreateVolume`; carries the disk bus.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to detach a volume from the VM backing a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    /// Volume to detach.
    pub volume_id: VolumeId,
    /// CSI node id reported by the node service (a VM firmware UUID).
    pub node_id: String,
}

/// Request to stage (format and mount) a hotplugged disk on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a Pod container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Target path inside the container.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier: the firmware UUID of the backing VM.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn disk_name_and_serial_derive_from_id() {
        let id = VolumeId::from("pvc-abcdefghijklmnopqrstuvwxyz");
        assert_eq!(id.disk_name(), "disk-pvc-abcdefghijklmnopqrstuvwxyz");
        assert_eq!(id.serial(), "pvc-abcdefghijklmnop");
        assert_eq!(id.serial().len(), MAX_SERIAL_LEN);

        // Re-deriving yields the same identity.
        assert_eq!(id.serial(), id.clone().serial());
        assert_eq!(id.disk_name(), id.clone().disk_name());
    }

    #[test]
    fn short_id_is_its_own_serial() {
        let id = VolumeId::from("vol-1");
        assert_eq!(id.serial(), "vol-1");
        assert_eq!(id.disk_name(), "disk-vol-1");
        assert_eq!(id.disk_image_name(), "vol-1");
    }

    #[test]
    fn serial_truncates_on_char_boundaries() {
        let id = VolumeId::from("ééééééééééééééééééééééé");
        assert_eq!(id.serial().chars().count(), MAX_SERIAL_LEN);
    }

    #[test]
    fn object_names_are_dns_subdomains() {
        let longest = "a".repeat(MAX_OBJECT_NAME_LEN);
        let too_long = "a".repeat(MAX_OBJECT_NAME_LEN + 1);
        for ok in ["vol-1", "pvc-0f3c", "a", "tenant.vol-1", longest.as_str()] {
            assert!(is_object_name(ok), "{ok}");
        }
        for bad in [
            "",
            ".",
            "..",
            "../secrets/admin",
            "vol/1",
            "Vol-1",
            "vol_1",
            "-vol",
            "vol-",
            "a..b",
            "vol-1%2F..",
            too_long.as_str(),
        ] {
            assert!(!is_object_name(bad), "{bad}");
        }
    }

    #[test]
    fn create_volume_request_default() {
        let req = CreateVolumeRequest::default();
        assert!(req.name.is_empty());
        assert_eq!(req.capacity_range.required_bytes, 0);
    }

    #[test]
    fn volume_capability_default() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.access_mode, AccessMode::ReadWriteOnce);
        assert_eq!(cap.fs_type, "ext4");
    }

    #[test]
    fn publish_request_defaults_missing_fields() {
        let req: ControllerPublishVolumeRequest =
            serde_json::from_str(r#"{"volume_id":"vol-1","node_id":"uuid-1"}"#)
                .expect("deserialize");
        assert!(req.volume_context.is_empty());
        assert!(!req.readonly);
    }
}
