//! QUIC client used by the tenant storage sidecar to issue CSI requests.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use super::server::MAX_MESSAGE_BYTES;
use crate::error::CsiError;
use crate::message::{CsiMessage, CsiRequest};
use crate::types::*;

/// A lightweight CSI client that sends [`CsiMessage`] requests over a single
/// QUIC connection and returns the server's response.
pub struct CsiClient {
    connection: quinn::Connection,
    request_timeout: Option<Duration>,
}

impl CsiClient {
    /// Establish a new QUIC connection to the CSI server at `addr`.
    ///
    /// * `addr`: socket address of the remote CSI server
    /// * `server_name`: TLS SNI name that must match a SAN in the server's
    ///   certificate
    /// * `tls_config`: client TLS configuration trusting the server's CA
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let bind = if addr.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let mut endpoint = quinn::Endpoint::client(bind).map_err(CsiError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;

        debug!(%addr, %server_name, "CSI QUIC connection established");
        Ok(Self {
            connection,
            request_timeout: None,
        })
    }

    /// Give up on a request after `timeout`.  The budget travels with each
    /// request so the server stops working on it at the same point.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional QUIC stream, writes the
    /// JSON-serialized request, finishes the send side, then reads the
    /// full response and deserializes it.  Dropping the returned future
    /// stops the stream, which makes the server abandon the request.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request_timeout {
            Some(timeout) => {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                tokio::time::timeout(timeout, self.round_trip(msg))
                    .await
                    .map_err(|_| CsiError::DeadlineExceeded(ms))?
            }
            None => self.round_trip(msg).await,
        }
    }

    async fn round_trip(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;

        let mut request = CsiRequest::new(msg.clone());
        if let Some(timeout) = self.request_timeout {
            request = request.with_timeout(timeout);
        }
        let payload = serde_json::to_vec(&request).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`Self::request`], but turns [`CsiMessage::Error`] into `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(msg).await? {
            CsiMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        match self.call(&CsiMessage::CreateVolume(req)).await? {
            CsiMessage::VolumeCreated(volume) => Ok(volume),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_volume(&self, volume_id: VolumeId) -> Result<(), CsiError> {
        self.call(&CsiMessage::DeleteVolume(volume_id))
            .await
            .and_then(expect_ok)
    }

    pub async fn controller_publish(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<(), CsiError> {
        self.call(&CsiMessage::ControllerPublishVolume(req))
            .await
            .and_then(expect_ok)
    }

    pub async fn controller_unpublish(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        self.call(&CsiMessage::ControllerUnpublishVolume(req))
            .await
            .and_then(expect_ok)
    }

    pub async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        match self.call(&CsiMessage::ControllerGetCapabilities).await? {
            CsiMessage::ControllerCapabilities(caps) => Ok(caps),
            other => Err(unexpected(other)),
        }
    }

    /// Close the underlying QUIC connection gracefully.
    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}

fn expect_ok(msg: CsiMessage) -> Result<(), CsiError> {
    match msg {
        CsiMessage::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(msg: CsiMessage) -> CsiError {
    CsiError::TransportError(format!("unexpected response: {msg}"))
}
