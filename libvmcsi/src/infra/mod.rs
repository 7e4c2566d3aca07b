//! Infra-cluster object model and API seams.
//!
//! The controller never talks HTTP directly.  It goes through two traits:
//!
//! * [`DiskImageRepository`]: list / create / delete DataVolume objects
//!   (the disk images that back CSI volumes).
//! * [`VmAttachmentManager`]: list VM instances and hotplug DataVolumes into
//!   or out of them.
//!
//! [`rest::InfraClient`] implements both against the infra cluster's API
//! server; [`memory::InMemoryInfra`] implements both in process for tests.

pub mod memory;
pub mod rest;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AccessMode;

pub const CDI_API_VERSION: &str = "cdi.kubevirt.io/v1beta1";
pub const DATA_VOLUME_KIND: &str = "DataVolume";

/// Errors returned by the infra cluster API seams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InfraError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("{0:?} is not a usable object name")]
    InvalidName(String),
}

impl InfraError {
    /// `true` when retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::Decode(_)
            | Self::InvalidName(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Object model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Volume mode of the PVC that CDI materializes for a DataVolume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// Resource name to quantity, e.g. `storage -> "10737418240"`.
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<VolumeMode>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// Where CDI populates the DataVolume from.  Volumes created by the driver
/// are always blank.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataVolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blank: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataVolumeSpec {
    #[serde(default)]
    pub source: DataVolumeSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcSpec>,
}

/// A disk image in the infra cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolume {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DataVolumeSpec,
}

impl DataVolume {
    /// Build a blank, single-writer DataVolume request.
    pub fn blank(
        name: impl Into<String>,
        storage_class_name: impl Into<String>,
        volume_mode: VolumeMode,
        requested_bytes: u64,
    ) -> Self {
        Self {
            api_version: CDI_API_VERSION.to_owned(),
            kind: DATA_VOLUME_KIND.to_owned(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: None,
            },
            spec: DataVolumeSpec {
                source: DataVolumeSource {
                    blank: Some(BTreeMap::new()),
                },
                pvc: Some(PvcSpec {
                    access_modes: vec![AccessMode::ReadWriteOnce],
                    storage_class_name: Some(storage_class_name.into()),
                    volume_mode: Some(volume_mode),
                    resources: ResourceRequirements {
                        requests: BTreeMap::from([(
                            "storage".to_owned(),
                            requested_bytes.to_string(),
                        )]),
                    },
                }),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Requested storage in bytes, when the request is a plain integer.
    pub fn requested_bytes(&self) -> Option<u64> {
        self.spec
            .pvc
            .as_ref()?
            .resources
            .requests
            .get("storage")?
            .parse()
            .ok()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Firmware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualMachineInstanceSpec {
    #[serde(default)]
    pub domain: DomainSpec,
}

/// A running VM in the infra cluster; one per tenant-cluster node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualMachineInstance {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

impl VirtualMachineInstance {
    /// Convenience constructor for a VM with a known firmware UUID.
    pub fn new(name: impl Into<String>, firmware_uuid: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: None,
            },
            spec: VirtualMachineInstanceSpec {
                domain: DomainSpec {
                    firmware: Some(Firmware {
                        uuid: Some(firmware_uuid.into()),
                    }),
                },
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn firmware_uuid(&self) -> Option<&str> {
        self.spec.domain.firmware.as_ref()?.uuid.as_deref()
    }
}

/// Disk device presented to the guest for a hotplugged volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HotplugDisk {
    pub name: String,
    pub serial: String,
    pub bus: String,
}

/// Attach or detach request for a DataVolume on a VM.
///
/// Detach requests carry no [`HotplugDisk`]; the disk is identified by
/// `volume_name` alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HotplugVolumeRequest {
    /// Name of the volume entry on the VM (the hotplug disk name).
    pub volume_name: String,
    /// DataVolume the entry refers to.
    pub data_volume: String,
    pub disk: Option<HotplugDisk>,
    /// Ephemeral hotplugs live on the running instance only and vanish on
    /// restart; persistent ones are recorded on the VM definition.
    pub ephemeral: bool,
}

// ---------------------------------------------------------------------------
// API seams
// ---------------------------------------------------------------------------

/// Infra-cluster API for disk images.
#[async_trait]
pub trait DiskImageRepository: Send + Sync {
    async fn list_disk_images(&self, namespace: &str) -> Result<Vec<DataVolume>, InfraError>;

    /// Submit a new DataVolume.  Fails with [`InfraError::AlreadyExists`]
    /// when an object with the same name exists.
    async fn create_disk_image(&self, namespace: &str, dv: &DataVolume)
    -> Result<(), InfraError>;

    async fn delete_disk_image(&self, namespace: &str, name: &str) -> Result<(), InfraError>;
}

/// Infra-cluster API for VMs and disk hotplug.
#[async_trait]
pub trait VmAttachmentManager: Send + Sync {
    async fn list_vms(&self, namespace: &str) -> Result<Vec<VirtualMachineInstance>, InfraError>;

    async fn get_vm(&self, namespace: &str, name: &str)
    -> Result<VirtualMachineInstance, InfraError>;

    async fn add_volume(
        &self,
        namespace: &str,
        vm_name: &str,
        req: &HotplugVolumeRequest,
    ) -> Result<(), InfraError>;

    async fn remove_volume(
        &self,
        namespace: &str,
        vm_name: &str,
        req: &HotplugVolumeRequest,
    ) -> Result<(), InfraError>;
}
