//! In-process infra cluster used by unit and integration tests.
//!
//! [`InMemoryInfra`] keeps DataVolumes, VMs and hotplugged volumes in maps
//! and records every call, so tests can assert both on the resulting state
//! and on exactly which API calls the controller made.  Failures can be
//! queued per operation with [`InMemoryInfra::fail_next`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    DataVolume, DiskImageRepository, HotplugVolumeRequest, InfraError, VirtualMachineInstance,
    VmAttachmentManager,
};

/// Operation names used for call recording and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfraOp {
    ListDiskImages,
    CreateDiskImage,
    DeleteDiskImage,
    ListVms,
    GetVm,
    AddVolume,
    RemoveVolume,
}

/// A recorded call: the operation plus the namespace and the object it
/// targeted (disk image name or VM name, empty for list calls).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraCall {
    pub op: InfraOp,
    pub namespace: String,
    pub target: String,
    pub hotplug: Option<HotplugVolumeRequest>,
}

#[derive(Default)]
struct State {
    data_volumes: BTreeMap<(String, String), DataVolume>,
    vms: BTreeMap<(String, String), VirtualMachineInstance>,
    /// (namespace, vm) -> volume name -> request
    hotplugged: HashMap<(String, String), BTreeMap<String, HotplugVolumeRequest>>,
    calls: Vec<InfraCall>,
    failures: HashMap<InfraOp, VecDeque<InfraError>>,
    stale_listing: bool,
}

#[derive(Default)]
pub struct InMemoryInfra {
    state: Mutex<State>,
}

impl InMemoryInfra {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_vm(&self, namespace: &str, vm: VirtualMachineInstance) {
        let key = (namespace.to_owned(), vm.name().to_owned());
        self.lock().vms.insert(key, vm);
    }

    pub fn insert_disk_image(&self, namespace: &str, dv: DataVolume) {
        let key = (namespace.to_owned(), dv.name().to_owned());
        self.lock().data_volumes.insert(key, dv);
    }

    pub fn disk_image(&self, namespace: &str, name: &str) -> Option<DataVolume> {
        self.lock()
            .data_volumes
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn disk_image_count(&self, namespace: &str) -> usize {
        self.lock()
            .data_volumes
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    /// Volumes currently hotplugged into `vm_name`.
    pub fn hotplugged(&self, namespace: &str, vm_name: &str) -> Vec<HotplugVolumeRequest> {
        self.lock()
            .hotplugged
            .get(&(namespace.to_owned(), vm_name.to_owned()))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<InfraCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: InfraOp) -> Vec<InfraCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Make the next call of `op` fail with `err`.  Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: InfraOp, err: InfraError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// When set, disk-image listings come back empty, as a stale cache or a
    /// concurrent creator between list and create would make them look.
    pub fn set_stale_listing(&self, stale: bool) {
        self.lock().stale_listing = stale;
    }

    /// Record the call and pop an injected failure for it, if any.
    fn enter(
        state: &mut State,
        op: InfraOp,
        namespace: &str,
        target: &str,
        hotplug: Option<&HotplugVolumeRequest>,
    ) -> Result<(), InfraError> {
        state.calls.push(InfraCall {
            op,
            namespace: namespace.to_owned(),
            target: target.to_owned(),
            hotplug: hotplug.cloned(),
        });
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DiskImageRepository for InMemoryInfra {
    async fn list_disk_images(&self, namespace: &str) -> Result<Vec<DataVolume>, InfraError> {
        let mut state = self.lock();
        Self::enter(&mut state, InfraOp::ListDiskImages, namespace, "", None)?;
        if state.stale_listing {
            return Ok(Vec::new());
        }
        Ok(state
            .data_volumes
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, dv)| dv.clone())
            .collect())
    }

    async fn create_disk_image(
        &self,
        namespace: &str,
        dv: &DataVolume,
    ) -> Result<(), InfraError> {
        let mut state = self.lock();
        Self::enter(&mut state, InfraOp::CreateDiskImage, namespace, dv.name(), None)?;
        let key = (namespace.to_owned(), dv.name().to_owned());
        if state.data_volumes.contains_key(&key) {
            return Err(InfraError::AlreadyExists(format!("datavolume {}", dv.name())));
        }
        let mut dv = dv.clone();
        dv.metadata.namespace = Some(namespace.to_owned());
        state.data_volumes.insert(key, dv);
        Ok(())
    }

    async fn delete_disk_image(&self, namespace: &str, name: &str) -> Result<(), InfraError> {
        let mut state = self.lock();
        Self::enter(&mut state, InfraOp::DeleteDiskImage, namespace, name, None)?;
        state
            .data_volumes
            .remove(&(namespace.to_owned(), name.to_owned()))
            .map(|_| ())
            .ok_or_else(|| InfraError::NotFound(format!("datavolume {name}")))
    }
}

#[async_trait]
impl VmAttachmentManager for InMemoryInfra {
    async fn list_vms(&self, namespace: &str) -> Result<Vec<VirtualMachineInstance>, InfraError> {
        let mut state = self.lock();
        Self::enter(&mut state, InfraOp::ListVms, namespace, "", None)?;
        Ok(state
            .vms
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, vm)| vm.clone())
            .collect())
    }

    async fn get_vm(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachineInstance, InfraError> {
        let mut state = self.lock();
        Self::enter(&mut state, InfraOp::GetVm, namespace, name, None)?;
        state
            .vms
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| InfraError::NotFound(format!("virtualmachineinstance {name}")))
    }

    async fn add_volume(
        &self,
        namespace: &str,
        vm_name: &str,
        req: &HotplugVolumeRequest,
    ) -> Result<(), InfraError> {
        let mut state = self.lock();
        Self::enter(&mut state, InfraOp::AddVolume, namespace, vm_name, Some(req))?;
        let vm_key = (namespace.to_owned(), vm_name.to_owned());
        if !state.vms.contains_key(&vm_key) {
            return Err(InfraError::NotFound(format!("virtualmachine {vm_name}")));
        }
        if !state
            .data_volumes
            .contains_key(&(namespace.to_owned(), req.data_volume.clone()))
        {
            return Err(InfraError::NotFound(format!("datavolume {}", req.data_volume)));
        }
        let volumes = state.hotplugged.entry(vm_key).or_default();
        if volumes.contains_key(&req.volume_name) {
            return Err(InfraError::AlreadyExists(format!(
                "volume {} on VM {vm_name}",
                req.volume_name
            )));
        }
        volumes.insert(req.volume_name.clone(), req.clone());
        Ok(())
    }

    async fn remove_volume(
        &self,
        namespace: &str,
        vm_name: &str,
        req: &HotplugVolumeRequest,
    ) -> Result<(), InfraError> {
        let mut state = self.lock();
        Self::enter(&mut state, InfraOp::RemoveVolume, namespace, vm_name, Some(req))?;
        let vm_key = (namespace.to_owned(), vm_name.to_owned());
        if !state.vms.contains_key(&vm_key) {
            return Err(InfraError::NotFound(format!("virtualmachine {vm_name}")));
        }
        state
            .hotplugged
            .get_mut(&vm_key)
            .and_then(|volumes| volumes.remove(&req.volume_name))
            .map(|_| ())
            .ok_or_else(|| {
                InfraError::NotFound(format!("volume {} on VM {vm_name}", req.volume_name))
            })
    }
}
