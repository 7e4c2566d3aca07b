//! Command-line flags for the `vmcsi` binary.
//!
//! Every flag can also be set through the environment variable named next
//! to it, which is how the driver is configured inside a Pod.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use libvmcsi::config::DEFAULT_DRIVER_NAME;

/// Which CSI roles this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Identity + controller, talking to the infra cluster.
    Controller,
    /// Identity + node, running inside a tenant VM.
    Node,
    /// All three roles in one process.
    All,
}

impl Mode {
    pub fn runs_controller(self) -> bool {
        matches!(self, Mode::Controller | Mode::All)
    }

    pub fn runs_node(self) -> bool {
        matches!(self, Mode::Node | Mode::All)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "vmcsi",
    version,
    about = "CSI driver backing tenant volumes with hotplugged infra-cluster VM disks"
)]
pub struct Cli {
    /// Address the QUIC CSI endpoint listens on.
    #[arg(long, env = "CSI_ENDPOINT", default_value = "0.0.0.0:10000")]
    pub endpoint: SocketAddr,

    #[arg(long, env = "VMCSI_MODE", value_enum, default_value_t = Mode::Controller)]
    pub mode: Mode,

    #[arg(long, env = "VMCSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    pub driver_name: String,

    /// Infra namespace holding the tenant VMs and their DataVolumes.
    #[arg(long, env = "INFRA_CLUSTER_NAMESPACE")]
    pub infra_cluster_namespace: Option<String>,

    /// Name of a tenant VM that must exist before the driver starts.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    #[arg(long, env = "INFRA_CLUSTER_API_URL")]
    pub infra_cluster_api_url: Option<String>,

    /// File holding the bearer token for the infra cluster API.
    #[arg(long, env = "INFRA_CLUSTER_TOKEN_FILE")]
    pub infra_cluster_token: Option<PathBuf>,

    /// PEM bundle of the infra cluster API's CA.
    #[arg(long, env = "INFRA_CLUSTER_CA_FILE")]
    pub infra_cluster_ca: Option<PathBuf>,

    #[arg(long, env = "VMCSI_TLS_CERT")]
    pub tls_cert: PathBuf,

    #[arg(long, env = "VMCSI_TLS_KEY")]
    pub tls_key: PathBuf,

    /// Node id override; read from the DMI product UUID when unset.
    #[arg(long, env = "VMCSI_NODE_ID")]
    pub node_id: Option<String>,

    #[arg(
        long,
        env = "VMCSI_FIRMWARE_UUID_PATH",
        default_value = "/sys/class/dmi/id/product_uuid"
    )]
    pub firmware_uuid_path: PathBuf,

    /// Per-request deadline in seconds.
    #[arg(
        long,
        env = "VMCSI_REQUEST_TIMEOUT",
        default_value_t = 120,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub request_timeout: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "VMCSI_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}
