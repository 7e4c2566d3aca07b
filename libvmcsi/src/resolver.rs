//! Node identity resolution.
//!
//! A CSI node id is the firmware UUID of the VM backing the tenant node.
//! Resolution lists every VM in the infra namespace on each call and scans
//! for a matching UUID; there is no index to go stale when VMs come and go.

use tracing::{debug, error};

use crate::error::CsiError;
use crate::infra::{VirtualMachineInstance, VmAttachmentManager};

/// Return the name of the first VM whose firmware UUID equals `node_id`.
/// UUIDs compare case-insensitively: the node side reports them lowercased.
pub fn find_vm_by_firmware_uuid<'a>(
    vms: &'a [VirtualMachineInstance],
    node_id: &str,
) -> Option<&'a str> {
    vms.iter()
        .find(|vm| {
            vm.firmware_uuid()
                .is_some_and(|uuid| uuid.eq_ignore_ascii_case(node_id))
        })
        .map(VirtualMachineInstance::name)
}

/// List the VMs in `namespace` and resolve `node_id` to a VM name.
///
/// Fails with [`CsiError::NodeNotFound`] when no VM matches.
pub async fn resolve_vm_name(
    vms: &dyn VmAttachmentManager,
    namespace: &str,
    node_id: &str,
) -> Result<String, CsiError> {
    let listing = vms.list_vms(namespace).await.map_err(|e| {
        error!(%namespace, error = %e, "failed to list VMs");
        CsiError::infra(format!("list VMs in {namespace}"), e)
    })?;

    match find_vm_by_firmware_uuid(&listing, node_id) {
        Some(name) => {
            debug!(%node_id, vm = name, "resolved node id");
            Ok(name.to_owned())
        }
        None => Err(CsiError::NodeNotFound(node_id.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::{InMemoryInfra, InfraOp};
    use crate::infra::{InfraError, ObjectMeta};

    fn fleet() -> Vec<VirtualMachineInstance> {
        vec![
            VirtualMachineInstance::new("worker-1", "uuid-1"),
            VirtualMachineInstance {
                metadata: ObjectMeta {
                    name: "no-firmware".into(),
                    namespace: None,
                },
                spec: Default::default(),
            },
            VirtualMachineInstance::new("worker-3", "uuid-3"),
            VirtualMachineInstance::new("worker-3-dup", "uuid-3"),
        ]
    }

    #[test]
    fn finds_matching_vm() {
        assert_eq!(find_vm_by_firmware_uuid(&fleet(), "uuid-1"), Some("worker-1"));
    }

    #[test]
    fn first_match_wins() {
        assert_eq!(find_vm_by_firmware_uuid(&fleet(), "uuid-3"), Some("worker-3"));
    }

    #[test]
    fn uuid_case_does_not_matter() {
        let vms = vec![VirtualMachineInstance::new(
            "worker-7",
            "6A1B2C3D-0000-4E5F-8899-AABBCCDDEEFF",
        )];
        assert_eq!(
            find_vm_by_firmware_uuid(&vms, "6a1b2c3d-0000-4e5f-8899-aabbccddeeff"),
            Some("worker-7")
        );
    }

    #[test]
    fn unknown_or_empty_id_has_no_match() {
        assert_eq!(find_vm_by_firmware_uuid(&fleet(), "uuid-9"), None);
        assert_eq!(find_vm_by_firmware_uuid(&fleet(), ""), None);
        assert_eq!(find_vm_by_firmware_uuid(&[], "uuid-1"), None);
    }

    #[tokio::test]
    async fn resolve_lists_fresh_every_call() {
        let infra = InMemoryInfra::new();
        infra.add_vm("tenant", VirtualMachineInstance::new("worker-1", "uuid-1"));

        assert_eq!(
            resolve_vm_name(&infra, "tenant", "uuid-1").await.unwrap(),
            "worker-1"
        );

        // A VM added after the first lookup is visible to the next one.
        infra.add_vm("tenant", VirtualMachineInstance::new("worker-2", "uuid-2"));
        assert_eq!(
            resolve_vm_name(&infra, "tenant", "uuid-2").await.unwrap(),
            "worker-2"
        );
        assert_eq!(infra.calls_of(InfraOp::ListVms).len(), 2);
    }

    #[tokio::test]
    async fn resolve_is_namespace_scoped() {
        let infra = InMemoryInfra::new();
        infra.add_vm("other", VirtualMachineInstance::new("worker-1", "uuid-1"));

        let err = resolve_vm_name(&infra, "tenant", "uuid-1").await.unwrap_err();
        assert_eq!(err, CsiError::NodeNotFound("uuid-1".into()));
    }

    #[tokio::test]
    async fn listing_failure_is_not_a_not_found() {
        let infra = InMemoryInfra::new();
        infra.fail_next(InfraOp::ListVms, InfraError::Transport("refused".into()));

        let err = resolve_vm_name(&infra, "tenant", "uuid-1").await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(err, CsiError::InfraApi { .. }));
    }
}
