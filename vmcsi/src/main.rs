//! `vmcsi`: runs the VM-disk CSI driver behind a QUIC endpoint.

mod cli;

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use libvmcsi::config::{DriverInfo, InfraClusterConfig, load_server_tls};
use libvmcsi::driver::device::DeviceLocator;
use libvmcsi::driver::{ControllerService, Driver, IdentityService, NodeService};
use libvmcsi::infra::VmAttachmentManager;
use libvmcsi::infra::rest::InfraClient;
use libvmcsi::transport::CsiServer;

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let driver = build_driver(&cli).await?;
    let tls = load_server_tls(&cli.tls_cert, &cli.tls_key).context("loading endpoint TLS")?;
    let server = CsiServer::new(cli.endpoint, tls, Arc::new(driver))
        .context("starting CSI endpoint")?
        .with_request_timeout(cli.request_timeout());

    info!(
        endpoint = %cli.endpoint,
        mode = ?cli.mode,
        driver = %cli.driver_name,
        "vmcsi started"
    );

    tokio::select! {
        res = server.serve() => res.context("CSI endpoint stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            server.endpoint().close(0u32.into(), b"shutdown");
        }
    }
    server.endpoint().wait_idle().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Infra access resolved from the flags: the shared client plus the
/// namespace every call targets.
struct Infra {
    client: Arc<InfraClient>,
    namespace: String,
}

fn connect_infra(cli: &Cli) -> anyhow::Result<Infra> {
    let (Some(api_url), Some(token), Some(namespace)) = (
        cli.infra_cluster_api_url.as_deref(),
        cli.infra_cluster_token.as_deref(),
        cli.infra_cluster_namespace.as_deref(),
    ) else {
        bail!(
            "--infra-cluster-api-url, --infra-cluster-token and \
             --infra-cluster-namespace are required to reach the infra cluster"
        );
    };

    let config =
        InfraClusterConfig::load(api_url, namespace, token, cli.infra_cluster_ca.as_deref())
            .context("loading infra cluster configuration")?;
    let client = InfraClient::new(&config).context("building infra cluster client")?;
    Ok(Infra {
        client: Arc::new(client),
        namespace: config.namespace,
    })
}

/// Fail unless the named tenant VM exists in the infra namespace.
async fn check_node_vm(
    vms: &dyn VmAttachmentManager,
    namespace: &str,
    name: &str,
) -> anyhow::Result<()> {
    vms.get_vm(namespace, name)
        .await
        .with_context(|| format!("tenant VM {name} not found in infra namespace {namespace}"))?;
    info!(vm = name, namespace, "tenant VM found");
    Ok(())
}

/// Compose the roles selected by `--mode`.
async fn build_driver(cli: &Cli) -> anyhow::Result<Driver> {
    let info = DriverInfo::from_build(cli.driver_name.clone()).context("driver identity")?;

    let infra = if cli.mode.runs_controller() || cli.node_name.is_some() {
        Some(connect_infra(cli)?)
    } else {
        None
    };

    if let (Some(name), Some(infra)) = (cli.node_name.as_deref(), infra.as_ref()) {
        check_node_vm(infra.client.as_ref(), &infra.namespace, name).await?;
    }

    let mut identity = IdentityService::new(info);
    if let Some(infra) = infra.as_ref().filter(|_| cli.mode.runs_controller()) {
        identity = identity.with_infra_probe(infra.client.clone(), infra.namespace.clone());
    }
    let mut driver = Driver::new(Arc::new(identity));

    if let Some(infra) = infra.filter(|_| cli.mode.runs_controller()) {
        let controller =
            ControllerService::new(infra.namespace, infra.client.clone(), infra.client);
        driver = driver.with_controller(Arc::new(controller));
    }

    if cli.mode.runs_node() {
        let node = match cli.node_id.as_deref() {
            Some(id) if !id.is_empty() => NodeService::new(id, DeviceLocator::default()),
            _ => NodeService::from_firmware(&cli.firmware_uuid_path, DeviceLocator::default())
                .await
                .context("reading node id from firmware")?,
        };
        driver = driver.with_node(Arc::new(node));
    } else if cli.node_id.is_some() {
        warn!("--node-id is ignored outside node mode");
    }

    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libvmcsi::CsiNode;
    use libvmcsi::infra::VirtualMachineInstance;
    use libvmcsi::infra::memory::InMemoryInfra;

    fn parse(extra: &[&str]) -> Cli {
        let base = ["vmcsi", "--tls-cert", "c.pem", "--tls-key", "k.pem"];
        Cli::try_parse_from(base.iter().chain(extra)).unwrap()
    }

    #[tokio::test]
    async fn node_mode_needs_no_infra_access() {
        let cli = parse(&["--mode", "node", "--node-id", "uuid-3"]);
        let driver = build_driver(&cli).await.unwrap();

        assert!(driver.controller().is_err());
        let info = driver.node().unwrap().get_info().await.unwrap();
        assert_eq!(info.node_id, "uuid-3");
    }

    #[tokio::test]
    async fn node_mode_reads_firmware_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        let uuid = tmp.path().join("product_uuid");
        std::fs::write(&uuid, "ABCD-1234\n").unwrap();

        let cli = parse(&["--mode", "node", "--firmware-uuid-path", uuid.to_str().unwrap()]);
        let driver = build_driver(&cli).await.unwrap();
        let info = driver.node().unwrap().get_info().await.unwrap();
        assert_eq!(info.node_id, "abcd-1234");
    }

    #[tokio::test]
    async fn controller_mode_requires_infra_flags() {
        let cli = parse(&["--mode", "controller"]);
        let err = build_driver(&cli).await.err().unwrap();
        assert!(err.to_string().contains("--infra-cluster-api-url"));
    }

    #[tokio::test]
    async fn controller_mode_with_infra_flags_builds() {
        let tmp = tempfile::tempdir().unwrap();
        let token = tmp.path().join("token");
        std::fs::write(&token, "secret\n").unwrap();

        let cli = parse(&[
            "--infra-cluster-api-url",
            "https://infra.example:6443",
            "--infra-cluster-token",
            token.to_str().unwrap(),
            "--infra-cluster-namespace",
            "tenant-a",
        ]);
        let driver = build_driver(&cli).await.unwrap();
        assert!(driver.controller().is_ok());
        assert!(driver.node().is_err());
    }

    #[tokio::test]
    async fn missing_node_vm_is_fatal() {
        let infra = InMemoryInfra::new();
        infra.add_vm("tenant-a", VirtualMachineInstance::new("worker-3", "uuid-3"));

        check_node_vm(&infra, "tenant-a", "worker-3").await.unwrap();
        let err = check_node_vm(&infra, "tenant-a", "worker-9")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("worker-9"));
    }
}
