//! Identity service: plugin name, version and health.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::DriverInfo;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::infra::VmAttachmentManager;
use crate::types::{PluginCapability, PluginInfo};

pub struct IdentityService {
    info: DriverInfo,
    /// Infra handle used to probe API reachability on controller instances.
    infra: Option<(Arc<dyn VmAttachmentManager>, String)>,
}

impl IdentityService {
    pub fn new(info: DriverInfo) -> Self {
        Self { info, infra: None }
    }

    /// Make the probe report unhealthy while the infra API cannot list VMs
    /// in `namespace`.  Also advertises the controller service.
    pub fn with_infra_probe(
        mut self,
        vms: Arc<dyn VmAttachmentManager>,
        namespace: impl Into<String>,
    ) -> Self {
        self.infra = Some((vms, namespace.into()));
        self
    }
}

#[async_trait]
impl CsiIdentity for IdentityService {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.info.name.clone(),
            vendor_version: self.info.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        let Some((vms, namespace)) = &self.infra else {
            return Ok(true);
        };
        match vms.list_vms(namespace).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(%namespace, error = %e, "infra cluster probe failed");
                Ok(false)
            }
        }
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        if self.infra.is_some() {
            Ok(vec![PluginCapability::ControllerService])
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InfraError;
    use crate::infra::memory::{InMemoryInfra, InfraOp};

    fn info() -> DriverInfo {
        DriverInfo::new("vmdisk.csi.rk8s.io", "1.2.3").unwrap()
    }

    #[tokio::test]
    async fn plugin_info_comes_from_config() {
        let svc = IdentityService::new(info());
        let plugin = svc.get_plugin_info().await.unwrap();
        assert_eq!(plugin.name, "vmdisk.csi.rk8s.io");
        assert_eq!(plugin.vendor_version, "1.2.3");
    }

    #[tokio::test]
    async fn node_only_identity_is_healthy_without_controller() {
        let svc = IdentityService::new(info());
        assert!(svc.probe().await.unwrap());
        assert!(svc.get_plugin_capabilities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn probe_follows_infra_reachability() {
        let infra = Arc::new(InMemoryInfra::new());
        let svc = IdentityService::new(info()).with_infra_probe(infra.clone(), "tenant");

        assert!(svc.probe().await.unwrap());
        infra.fail_next(InfraOp::ListVms, InfraError::Transport("refused".into()));
        assert!(!svc.probe().await.unwrap());
        assert!(svc.probe().await.unwrap());

        assert_eq!(
            svc.get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::ControllerService]
        );
    }
}
