//! Controller service backed by infra-cluster DataVolumes and VM hotplug.
//!
//! The service keeps no state of its own.  A volume id is the name of its
//! DataVolume, and the hotplug disk name and serial are re-derived from the
//! id on every call, so attach and detach always agree on the device without
//! a persisted mapping.  Every call re-reads the infra cluster.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::infra::{
    DataVolume, DiskImageRepository, HotplugDisk, HotplugVolumeRequest, InfraError,
    VmAttachmentManager, VolumeMode,
};
use crate::resolver;
use crate::types::*;

/// Capabilities advertised by `ControllerGetCapabilities`, in order.
pub const CONTROLLER_CAPABILITIES: [ControllerCapability; 2] = [
    ControllerCapability::CreateDeleteVolume,
    ControllerCapability::PublishUnpublishVolume,
];

pub struct ControllerService {
    namespace: String,
    disk_images: Arc<dyn DiskImageRepository>,
    vms: Arc<dyn VmAttachmentManager>,
}

impl ControllerService {
    /// * `namespace`: infra namespace holding the tenant VMs and DataVolumes
    /// * `disk_images` / `vms`: shared infra API handles
    pub fn new(
        namespace: impl Into<String>,
        disk_images: Arc<dyn DiskImageRepository>,
        vms: Arc<dyn VmAttachmentManager>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            disk_images,
            vms,
        }
    }

    async fn disk_image_exists(&self, name: &str) -> Result<bool, CsiError> {
        let existing = self
            .disk_images
            .list_disk_images(&self.namespace)
            .await
            .map_err(|e| CsiError::infra(format!("list disk images in {}", self.namespace), e))?;
        Ok(existing.iter().any(|dv| dv.name() == name))
    }
}

/// Volume description returned by `CreateVolume`.  Built from the request so
/// a retried create answers the same way whether or not it provisioned.
fn volume_response(name: &str, capacity_bytes: u64, bus: Option<&str>) -> Volume {
    let mut volume_context = HashMap::new();
    if let Some(bus) = bus {
        volume_context.insert(PARAM_BUS.to_owned(), bus.to_owned());
    }
    Volume {
        volume_id: VolumeId::from(name),
        capacity_bytes,
        volume_context,
    }
}

/// Reject anything that cannot name an infra object, so caller input never
/// shapes an API path beyond its own segment.
fn require_object_name(what: &str, name: &str) -> Result<(), CsiError> {
    if name.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    if !is_object_name(name) {
        return Err(CsiError::InvalidArgument(format!(
            "{what} {name:?} is not a DNS-1123 subdomain"
        )));
    }
    Ok(())
}

fn non_empty<'a>(map: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Attach request for `volume_id`: DataVolume source plus a disk device with
/// the derived name and serial.
fn attach_request(volume_id: &VolumeId, bus: &str) -> HotplugVolumeRequest {
    let disk_name = volume_id.disk_name();
    HotplugVolumeRequest {
        volume_name: disk_name.clone(),
        data_volume: volume_id.disk_image_name().to_owned(),
        disk: Some(HotplugDisk {
            name: disk_name,
            serial: volume_id.serial(),
            bus: bus.to_owned(),
        }),
        ephemeral: false,
    }
}

/// Detach request for `volume_id`: only the DataVolume and disk name.
fn detach_request(volume_id: &VolumeId) -> HotplugVolumeRequest {
    HotplugVolumeRequest {
        volume_name: volume_id.disk_name(),
        data_volume: volume_id.disk_image_name().to_owned(),
        disk: None,
        ephemeral: false,
    }
}

#[async_trait]
impl CsiController for ControllerService {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        require_object_name("volume name", &req.name)?;
        let storage_class = non_empty(&req.parameters, PARAM_INFRA_STORAGE_CLASS).ok_or_else(
            || {
                CsiError::InvalidArgument(format!(
                    "storage class parameter {PARAM_INFRA_STORAGE_CLASS} is required"
                ))
            },
        )?;
        let bus = non_empty(&req.parameters, PARAM_BUS);
        let capacity = req.capacity_range.required_bytes;

        // Thin provisioning is accepted for forward compatibility only.
        if let Some(raw) = req.parameters.get(PARAM_THIN_PROVISIONING)
            && raw.parse::<bool>().is_err()
        {
            warn!(value = %raw, "ignoring unparseable {PARAM_THIN_PROVISIONING} parameter");
        }

        info!(capacity, storage_class, "creating disk image");

        // The existing object is not compared with the request: a retry with
        // a different capacity or class reports the requested values.
        if self.disk_image_exists(&req.name).await? {
            debug!("disk image already exists, returning it");
            return Ok(volume_response(&req.name, capacity, bus));
        }

        let dv = DataVolume::blank(&req.name, storage_class, VolumeMode::Filesystem, capacity);
        match self.disk_images.create_disk_image(&self.namespace, &dv).await {
            Ok(()) => info!("disk image created"),
            // Lost the race between list and create to a concurrent caller.
            Err(InfraError::AlreadyExists(_)) => {
                info!("disk image created concurrently, returning it");
            }
            Err(e) => {
                error!(error = %e, "failed to create disk image");
                return Err(CsiError::infra(format!("create disk image {}", req.name), e));
            }
        }

        Ok(volume_response(&req.name, capacity, bus))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        require_object_name("volume id", volume_id.disk_image_name())?;
        info!("removing disk image");

        match self
            .disk_images
            .delete_disk_image(&self.namespace, volume_id.disk_image_name())
            .await
        {
            Ok(()) => Ok(()),
            Err(InfraError::NotFound(_)) => {
                debug!("disk image already gone");
                Ok(())
            }
            Err(e) => Err(CsiError::infra(format!("delete disk image {volume_id}"), e)),
        }
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn publish_volume(&self, req: ControllerPublishVolumeRequest) -> Result<(), CsiError> {
        require_object_name("volume id", req.volume_id.disk_image_name())?;
        if req.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }
        let bus = non_empty(&req.volume_context, PARAM_BUS).ok_or_else(|| {
            CsiError::InvalidArgument(format!("volume context is missing {PARAM_BUS}"))
        })?;

        let vm_name =
            resolver::resolve_vm_name(self.vms.as_ref(), &self.namespace, &req.node_id).await?;
        let hotplug = attach_request(&req.volume_id, bus);
        info!(
            vm = %vm_name,
            disk = %hotplug.volume_name,
            serial = hotplug.disk.as_ref().map(|d| d.serial.as_str()),
            bus,
            "attaching disk image",
        );

        match self.vms.add_volume(&self.namespace, &vm_name, &hotplug).await {
            Ok(()) => Ok(()),
            Err(InfraError::AlreadyExists(_)) => {
                debug!(vm = %vm_name, "disk already attached");
                Ok(())
            }
            Err(e) => Err(CsiError::infra(
                format!("attach {} to VM {vm_name}", req.volume_id),
                e,
            )),
        }
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        require_object_name("volume id", req.volume_id.disk_image_name())?;
        if req.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }

        let vm_name =
            resolver::resolve_vm_name(self.vms.as_ref(), &self.namespace, &req.node_id).await?;
        let hotplug = detach_request(&req.volume_id);
        info!(vm = %vm_name, disk = %hotplug.volume_name, "detaching disk image");

        match self.vms.remove_volume(&self.namespace, &vm_name, &hotplug).await {
            Ok(()) => Ok(()),
            Err(InfraError::NotFound(_)) => {
                debug!(vm = %vm_name, "disk not attached");
                Ok(())
            }
            Err(e) => Err(CsiError::infra(
                format!("detach {} from VM {vm_name}", req.volume_id),
                e,
            )),
        }
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(CONTROLLER_CAPABILITIES.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::VirtualMachineInstance;
    use crate::infra::memory::{InMemoryInfra, InfraOp};

    const NS: &str = "tenant";
    const GIB: u64 = 1 << 30;

    fn setup() -> (Arc<InMemoryInfra>, ControllerService) {
        let infra = Arc::new(InMemoryInfra::new());
        infra.add_vm(NS, VirtualMachineInstance::new("worker-3", "uuid-3"));
        let svc = ControllerService::new(NS, infra.clone(), infra.clone());
        (infra, svc)
    }

    fn create_req(name: &str, bytes: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: CapacityRange {
                required_bytes: bytes,
                limit_bytes: 0,
            },
            parameters: HashMap::from([
                (PARAM_INFRA_STORAGE_CLASS.to_owned(), "infra-sc".to_owned()),
                (PARAM_BUS.to_owned(), "virtio".to_owned()),
            ]),
            ..Default::default()
        }
    }

    fn publish_req(volume_id: &str, node_id: &str) -> ControllerPublishVolumeRequest {
        ControllerPublishVolumeRequest {
            volume_id: volume_id.into(),
            node_id: node_id.into(),
            volume_capability: VolumeCapability::default(),
            readonly: false,
            volume_context: HashMap::from([(PARAM_BUS.to_owned(), "virtio".to_owned())]),
        }
    }

    fn unpublish_req(volume_id: &str, node_id: &str) -> ControllerUnpublishVolumeRequest {
        ControllerUnpublishVolumeRequest {
            volume_id: volume_id.into(),
            node_id: node_id.into(),
        }
    }

    #[tokio::test]
    async fn create_volume_builds_blank_filesystem_disk_image() {
        let (infra, svc) = setup();

        let vol = svc.create_volume(create_req("vol-1", 10 * GIB)).await.unwrap();
        assert_eq!(vol.volume_id, VolumeId::from("vol-1"));
        assert_eq!(vol.capacity_bytes, 10 * GIB);
        assert_eq!(
            vol.volume_context,
            HashMap::from([(PARAM_BUS.to_owned(), "virtio".to_owned())])
        );

        let dv = infra.disk_image(NS, "vol-1").expect("disk image created");
        let pvc = dv.spec.pvc.as_ref().unwrap();
        assert_eq!(pvc.access_modes, vec![AccessMode::ReadWriteOnce]);
        assert_eq!(pvc.volume_mode, Some(VolumeMode::Filesystem));
        assert_eq!(pvc.storage_class_name.as_deref(), Some("infra-sc"));
        assert_eq!(dv.requested_bytes(), Some(10 * GIB));
    }

    #[tokio::test]
    async fn create_volume_is_idempotent_by_name() {
        let (infra, svc) = setup();

        let first = svc.create_volume(create_req("vol-1", GIB)).await.unwrap();
        // Different capacity on retry: still the same volume, nothing new.
        let second = svc.create_volume(create_req("vol-1", 2 * GIB)).await.unwrap();

        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(second.capacity_bytes, 2 * GIB);
        assert_eq!(infra.disk_image_count(NS), 1);
        assert_eq!(infra.calls_of(InfraOp::CreateDiskImage).len(), 1);
        // The stored object keeps its original size.
        assert_eq!(infra.disk_image(NS, "vol-1").unwrap().requested_bytes(), Some(GIB));
    }

    #[tokio::test]
    async fn create_volume_race_with_concurrent_creator_succeeds() {
        let (infra, svc) = setup();
        svc.create_volume(create_req("vol-1", GIB)).await.unwrap();

        // The listing misses the object; the create is rejected as a duplicate.
        infra.set_stale_listing(true);
        let vol = svc.create_volume(create_req("vol-1", GIB)).await.unwrap();

        assert_eq!(vol.volume_id, VolumeId::from("vol-1"));
        assert_eq!(infra.disk_image_count(NS), 1);
        assert_eq!(infra.calls_of(InfraOp::CreateDiskImage).len(), 2);
    }

    #[tokio::test]
    async fn create_volume_surfaces_upstream_failure_without_retry() {
        let (infra, svc) = setup();
        infra.fail_next(
            InfraOp::CreateDiskImage,
            InfraError::Api {
                status: 503,
                message: "apiserver overloaded".into(),
            },
        );

        let err = svc.create_volume(create_req("vol-1", GIB)).await.unwrap_err();
        assert!(matches!(err, CsiError::InfraApi { transient: true, .. }));
        assert_eq!(infra.calls_of(InfraOp::CreateDiskImage).len(), 1);
        assert_eq!(infra.disk_image_count(NS), 0);
    }

    #[tokio::test]
    async fn create_volume_list_failure_creates_nothing() {
        let (infra, svc) = setup();
        infra.fail_next(InfraOp::ListDiskImages, InfraError::Transport("refused".into()));

        assert!(svc.create_volume(create_req("vol-1", GIB)).await.is_err());
        assert!(infra.calls_of(InfraOp::CreateDiskImage).is_empty());
    }

    #[tokio::test]
    async fn create_volume_requires_name_and_storage_class() {
        let (infra, svc) = setup();

        let err = svc.create_volume(create_req("", GIB)).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));

        let mut req = create_req("vol-1", GIB);
        req.parameters.remove(PARAM_INFRA_STORAGE_CLASS);
        let err = svc.create_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));

        assert!(infra.calls().is_empty());
    }

    #[tokio::test]
    async fn create_volume_adopts_disk_image_left_by_earlier_run() {
        let (infra, svc) = setup();
        infra.insert_disk_image(
            NS,
            DataVolume::blank("vol-1", "old-sc", VolumeMode::Filesystem, GIB),
        );

        let vol = svc.create_volume(create_req("vol-1", GIB)).await.unwrap();
        assert_eq!(vol.volume_id, VolumeId::from("vol-1"));
        assert!(infra.calls_of(InfraOp::CreateDiskImage).is_empty());
        let dv = infra.disk_image(NS, "vol-1").unwrap();
        let pvc = dv.spec.pvc.as_ref().unwrap();
        assert_eq!(pvc.storage_class_name.as_deref(), Some("old-sc"));
    }

    #[tokio::test]
    async fn malformed_volume_ids_never_reach_the_infra_api() {
        let (infra, svc) = setup();
        svc.create_volume(create_req("vol-1", GIB)).await.unwrap();
        let before = infra.calls().len();

        for id in [
            "../../../../../api/v1/namespaces/kube-system/secrets/admin-token",
            "..",
            "vol-1/../vol-2",
            "Vol-1",
            "vol_1",
        ] {
            let err = svc.create_volume(create_req(id, GIB)).await.unwrap_err();
            assert!(matches!(err, CsiError::InvalidArgument(_)), "create {id}: {err}");

            let err = svc.delete_volume(&VolumeId::from(id)).await.unwrap_err();
            assert!(matches!(err, CsiError::InvalidArgument(_)), "delete {id}: {err}");

            let err = svc
                .publish_volume(publish_req(id, "uuid-3"))
                .await
                .unwrap_err();
            assert!(matches!(err, CsiError::InvalidArgument(_)), "publish {id}: {err}");

            let err = svc
                .unpublish_volume(unpublish_req(id, "uuid-3"))
                .await
                .unwrap_err();
            assert!(matches!(err, CsiError::InvalidArgument(_)), "unpublish {id}: {err}");
        }

        assert_eq!(infra.calls().len(), before);
        assert_eq!(infra.disk_image_count(NS), 1);
    }

    #[tokio::test]
    async fn create_volume_ignores_thin_provisioning() {
        let (infra, svc) = setup();
        let mut req = create_req("vol-1", GIB);
        req.parameters
            .insert(PARAM_THIN_PROVISIONING.to_owned(), "maybe".to_owned());

        let vol = svc.create_volume(req).await.unwrap();
        assert!(!vol.volume_context.contains_key(PARAM_THIN_PROVISIONING));
        assert!(infra.disk_image(NS, "vol-1").is_some());
    }

    #[tokio::test]
    async fn delete_volume_removes_disk_image() {
        let (infra, svc) = setup();
        svc.create_volume(create_req("vol-1", GIB)).await.unwrap();

        svc.delete_volume(&VolumeId::from("vol-1")).await.unwrap();
        assert!(infra.disk_image(NS, "vol-1").is_none());
    }

    #[tokio::test]
    async fn delete_missing_volume_succeeds() {
        let (infra, svc) = setup();
        svc.delete_volume(&VolumeId::from("ghost")).await.unwrap();
        assert_eq!(infra.calls_of(InfraOp::DeleteDiskImage).len(), 1);
    }

    #[tokio::test]
    async fn delete_volume_propagates_upstream_failure() {
        let (infra, svc) = setup();
        infra.fail_next(
            InfraOp::DeleteDiskImage,
            InfraError::Api {
                status: 403,
                message: "forbidden".into(),
            },
        );
        let err = svc.delete_volume(&VolumeId::from("vol-1")).await.unwrap_err();
        assert!(matches!(err, CsiError::InfraApi { transient: false, .. }));
    }

    #[tokio::test]
    async fn publish_attaches_derived_disk_to_resolved_vm() {
        let (infra, svc) = setup();
        svc.create_volume(create_req("pvc-abcdefghijklmnopqrstuvwxyz", GIB))
            .await
            .unwrap();

        svc.publish_volume(publish_req("pvc-abcdefghijklmnopqrstuvwxyz", "uuid-3"))
            .await
            .unwrap();

        let attached = infra.hotplugged(NS, "worker-3");
        assert_eq!(attached.len(), 1);
        let hotplug = &attached[0];
        assert_eq!(hotplug.volume_name, "disk-pvc-abcdefghijklmnopqrstuvwxyz");
        assert_eq!(hotplug.data_volume, "pvc-abcdefghijklmnopqrstuvwxyz");
        assert!(!hotplug.ephemeral);
        let disk = hotplug.disk.as_ref().unwrap();
        assert_eq!(disk.name, "disk-pvc-abcdefghijklmnopqrstuvwxyz");
        assert_eq!(disk.serial, "pvc-abcdefghijklmnop");
        assert_eq!(disk.bus, "virtio");
    }

    #[tokio::test]
    async fn publish_to_unknown_node_makes_no_attach_call() {
        let (infra, svc) = setup();
        svc.create_volume(create_req("vol-1", GIB)).await.unwrap();

        let err = svc
            .publish_volume(publish_req("vol-1", "uuid-unknown"))
            .await
            .unwrap_err();
        assert_eq!(err, CsiError::NodeNotFound("uuid-unknown".into()));
        assert!(err.is_not_found());
        assert!(infra.calls_of(InfraOp::AddVolume).is_empty());
    }

    #[tokio::test]
    async fn publish_requires_bus() {
        let (infra, svc) = setup();
        let mut req = publish_req("vol-1", "uuid-3");
        req.volume_context.clear();

        let err = svc.publish_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(infra.calls().is_empty());
    }

    #[tokio::test]
    async fn publish_twice_is_a_no_op() {
        let (infra, svc) = setup();
        svc.create_volume(create_req("vol-1", GIB)).await.unwrap();

        svc.publish_volume(publish_req("vol-1", "uuid-3")).await.unwrap();
        svc.publish_volume(publish_req("vol-1", "uuid-3")).await.unwrap();

        assert_eq!(infra.hotplugged(NS, "worker-3").len(), 1);
    }

    #[tokio::test]
    async fn publish_of_missing_disk_image_fails() {
        let (_infra, svc) = setup();
        let err = svc
            .publish_volume(publish_req("ghost", "uuid-3"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::InfraApi { .. }));
    }

    #[tokio::test]
    async fn unpublish_detaches_by_disk_name_only() {
        let (infra, svc) = setup();
        svc.create_volume(create_req("vol-1", GIB)).await.unwrap();
        svc.publish_volume(publish_req("vol-1", "uuid-3")).await.unwrap();

        svc.unpublish_volume(unpublish_req("vol-1", "uuid-3"))
            .await
            .unwrap();

        assert!(infra.hotplugged(NS, "worker-3").is_empty());
        let detach = infra.calls_of(InfraOp::RemoveVolume);
        assert_eq!(detach.len(), 1);
        assert_eq!(detach[0].target, "worker-3");
        let hotplug = detach[0].hotplug.as_ref().unwrap();
        assert_eq!(hotplug.volume_name, "disk-vol-1");
        assert_eq!(hotplug.data_volume, "vol-1");
        assert!(hotplug.disk.is_none());
    }

    #[tokio::test]
    async fn unpublish_of_never_attached_volume_keeps_publish_working() {
        let (infra, svc) = setup();
        svc.create_volume(create_req("vol-1", GIB)).await.unwrap();

        svc.unpublish_volume(unpublish_req("vol-1", "uuid-3"))
            .await
            .unwrap();
        svc.publish_volume(publish_req("vol-1", "uuid-3")).await.unwrap();

        assert_eq!(infra.hotplugged(NS, "worker-3").len(), 1);
    }

    #[tokio::test]
    async fn unpublish_from_unknown_node_is_not_found() {
        let (infra, svc) = setup();
        let err = svc
            .unpublish_volume(unpublish_req("vol-1", "uuid-unknown"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(infra.calls_of(InfraOp::RemoveVolume).is_empty());
    }

    #[tokio::test]
    async fn capabilities_are_stable() {
        let (_infra, svc) = setup();
        let first = svc.get_capabilities().await.unwrap();
        let second = svc.get_capabilities().await.unwrap();
        assert_eq!(
            first,
            vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::PublishUnpublishVolume
            ]
        );
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unsupported_rpcs_are_typed_unimplemented() {
        let (infra, svc) = setup();
        let id = VolumeId::from("vol-1");

        let results = [
            svc.validate_volume_capabilities(&id, &[]).await.map(|_| ()),
            svc.list_volumes().await.map(|_| ()),
            svc.get_capacity().await.map(|_| ()),
            svc.create_snapshot(&id, "snap").await.map(|_| ()),
            svc.delete_snapshot("snap").await,
            svc.list_snapshots().await.map(|_| ()),
            svc.expand_volume(&id, GIB).await.map(|_| ()),
        ];
        for result in results {
            let err = result.unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::Unimplemented, "{err}");
        }
        assert!(infra.calls().is_empty());
    }
}
