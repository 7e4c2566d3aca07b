//! # libvmcsi: CSI controller bridge for VM-hosted tenant clusters
//!
//! `libvmcsi` lets a tenant cluster whose nodes are virtual machines consume
//! block storage from the infra cluster hosting those VMs.  Each tenant
//! volume is a DataVolume in the infra cluster; attaching it to a tenant
//! node hotplugs that DataVolume into the node's VM as a disk whose serial
//! is derived from the volume id.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] and its [`ErrorCode`] classification. |
//! | [`config`] | Driver identity, infra cluster connection and TLS loading. |
//! | [`infra`] | Infra cluster object model, client traits, REST and in-memory impls. |
//! | [`resolver`] | Maps a tenant node id to the VM that backs it. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: create, delete, attach, detach. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`driver`] | The concrete services and their [`Driver`] composition. |
//! | [`message`] | [`CsiMessage`] and the [`CsiRequest`] envelope for QUIC transport. |
//! | [`transport`] | QUIC client/server built on `quinn`. |

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod infra;
pub mod message;
pub mod node;
pub mod resolver;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use config::{DriverInfo, InfraClusterConfig};
pub use controller::CsiController;
pub use driver::Driver;
pub use error::{CsiError, ErrorCode};
pub use identity::CsiIdentity;
pub use message::{CsiMessage, CsiRequest};
pub use node::CsiNode;
pub use types::*;
