//! Concrete CSI services and their composition.
//!
//! Each role is its own type: [`IdentityService`], [`ControllerService`] and
//! [`NodeService`].  A [`Driver`] holds one reference per role and is what the
//! transport dispatches into.  A controller deployment has no node role and a
//! node deployment has no controller role; calls to an absent role come back
//! as [`CsiError::Unimplemented`].

pub mod controller;
pub mod device;
pub mod identity;
pub mod node;

use std::sync::Arc;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;

#[derive(Clone)]
pub struct Driver {
    identity: Arc<dyn CsiIdentity>,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
}

impl Driver {
    pub fn new(identity: Arc<dyn CsiIdentity>) -> Self {
        Self {
            identity,
            controller: None,
            node: None,
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn CsiController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<dyn CsiNode>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn identity(&self) -> &dyn CsiIdentity {
        self.identity.as_ref()
    }

    pub fn controller(&self) -> Result<&dyn CsiController, CsiError> {
        self.controller
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented("controller service".into()))
    }

    pub fn node(&self) -> Result<&dyn CsiNode, CsiError> {
        self.node
            .as_deref()
            .ok_or_else(|| CsiError::Unimplemented("node service".into()))
    }
}
