//! Identity role: who the driver is and whether it can do its job.
//!
//! Controller instances report unhealthy while the infra cluster API is
//! unreachable, so the orchestrator can restart or route around them.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Driver name and vendor version, fixed for the life of the process.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// `Ok(false)` means running but unable to serve; `Err` is reserved for
    /// failures of the probe itself.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Services this deployment offers beyond identity.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
