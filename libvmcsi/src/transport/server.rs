//! QUIC server that accepts CSI requests and dispatches them to the
//! [`Driver`]'s identity, controller and node roles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::driver::Driver;
use crate::error::CsiError;
use crate::message::{CsiMessage, CsiRequest};

/// Upper bound on a single request or response payload.
pub(crate) const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Deadline applied to each request when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to a [`Driver`].
pub struct CsiServer {
    endpoint: quinn::Endpoint,
    driver: Arc<Driver>,
    request_timeout: Duration,
}

impl CsiServer {
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        driver: Arc<Driver>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(addr = %endpoint.local_addr().unwrap_or(addr), "CSI QUIC server listening");
        Ok(Self {
            endpoint,
            driver,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Upper bound on a single request.  A caller may ask for less.  When the
    /// deadline expires the handler future is dropped, which cancels every
    /// infra API call still in flight.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let driver = Arc::clone(&self.driver);
            let timeout = self.request_timeout;
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, driver, timeout).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(
        conn: quinn::Connection,
        driver: Arc<Driver>,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let driver = Arc::clone(&driver);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &driver, timeout).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    ///
    /// If the caller stops the stream or the connection drops while the
    /// request is in flight, the dispatch is abandoned.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        driver: &Driver,
        cap: Duration,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::transport)?;

        let response = match serde_json::from_slice::<CsiRequest>(&buf) {
            Ok(request) => {
                let timeout = request.effective_timeout(cap);
                debug!(request = %request.message, ?timeout, "CSI request received");
                let caller_gone = send.stopped();
                tokio::select! {
                    response = Self::dispatch_with_deadline(driver, request.message, timeout) => {
                        response
                    }
                    reason = caller_gone => {
                        warn!(?reason, "caller went away, abandoning CSI request");
                        return Ok(());
                    }
                }
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Run [`Self::dispatch`] under `timeout` and fold errors into
    /// [`CsiMessage::Error`].
    pub(crate) async fn dispatch_with_deadline(
        driver: &Driver,
        request: CsiMessage,
        timeout: Duration,
    ) -> CsiMessage {
        let name = request.to_string();
        match tokio::time::timeout(timeout, Self::dispatch(driver, request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(request = %name, code = ?e.code(), error = %e, "CSI request failed");
                CsiMessage::Error(e)
            }
            Err(_) => {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(request = %name, timeout_ms = ms, "CSI request deadline exceeded");
                CsiMessage::Error(CsiError::DeadlineExceeded(ms))
            }
        }
    }

    /// Map a [`CsiMessage`] request to the correct service call and wrap the
    /// result in a response [`CsiMessage`].
    async fn dispatch(driver: &Driver, request: CsiMessage) -> Result<CsiMessage, CsiError> {
        let response = match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => CsiMessage::ProbeResult(driver.identity().probe().await?),
            CsiMessage::GetPluginInfo => {
                CsiMessage::PluginInfoResponse(driver.identity().get_plugin_info().await?)
            }
            CsiMessage::GetPluginCapabilities => CsiMessage::PluginCapabilitiesResponse(
                driver.identity().get_plugin_capabilities().await?,
            ),

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => {
                CsiMessage::VolumeCreated(driver.controller()?.create_volume(req).await?)
            }
            CsiMessage::DeleteVolume(id) => {
                driver.controller()?.delete_volume(&id).await?;
                CsiMessage::Ok
            }
            CsiMessage::ControllerPublishVolume(req) => {
                driver.controller()?.publish_volume(req).await?;
                CsiMessage::Ok
            }
            CsiMessage::ControllerUnpublishVolume(req) => {
                driver.controller()?.unpublish_volume(req).await?;
                CsiMessage::Ok
            }
            CsiMessage::ControllerGetCapabilities => {
                CsiMessage::ControllerCapabilities(driver.controller()?.get_capabilities().await?)
            }
            CsiMessage::ListVolumes => {
                CsiMessage::VolumeList(driver.controller()?.list_volumes().await?)
            }
            CsiMessage::GetCapacity => {
                CsiMessage::Capacity(driver.controller()?.get_capacity().await?)
            }
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => CsiMessage::CapabilitiesValid(
                driver
                    .controller()?
                    .validate_volume_capabilities(&volume_id, &capabilities)
                    .await?,
            ),
            CsiMessage::CreateSnapshot {
                source_volume_id,
                name,
            } => CsiMessage::SnapshotCreated(
                driver
                    .controller()?
                    .create_snapshot(&source_volume_id, &name)
                    .await?,
            ),
            CsiMessage::DeleteSnapshot(id) => {
                driver.controller()?.delete_snapshot(&id).await?;
                CsiMessage::Ok
            }
            CsiMessage::ListSnapshots => {
                CsiMessage::SnapshotList(driver.controller()?.list_snapshots().await?)
            }
            CsiMessage::ControllerExpandVolume {
                volume_id,
                required_bytes,
            } => CsiMessage::VolumeExpanded(
                driver
                    .controller()?
                    .expand_volume(&volume_id, required_bytes)
                    .await?,
            ),

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => {
                driver.node()?.stage_volume(req).await?;
                CsiMessage::Ok
            }
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => {
                driver
                    .node()?
                    .unstage_volume(&volume_id, &staging_target_path)
                    .await?;
                CsiMessage::Ok
            }
            CsiMessage::PublishVolume(req) => {
                driver.node()?.publish_volume(req).await?;
                CsiMessage::Ok
            }
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => {
                driver
                    .node()?
                    .unpublish_volume(&volume_id, &target_path)
                    .await?;
                CsiMessage::Ok
            }
            CsiMessage::GetNodeInfo => CsiMessage::NodeInfoResponse(driver.node()?.get_info().await?),

            // --- Response variants should never arrive as requests ----------
            other => {
                return Err(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )));
            }
        };
        Ok(response)
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
