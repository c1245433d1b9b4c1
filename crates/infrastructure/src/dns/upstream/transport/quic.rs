use super::{DnsTransport, TransportResponse};
use async_trait::async_trait;
use homegate_domain::DomainError;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint};
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// DNS over QUIC (RFC 9250): one bidirectional stream per query, two-byte
/// length prefix, ALPN `doq`. The connection is reused until it errors.
pub struct QuicTransport {
    server_addr: SocketAddr,
    server_name: String,
    client_config: QuinnClientConfig,
    // The endpoint must outlive its connections; both are replaced together.
    connection: Mutex<Option<(Endpoint, quinn::Connection)>>,
}

impl QuicTransport {
    pub fn new(
        server_addr: SocketAddr,
        server_name: String,
        tls_config: Arc<ClientConfig>,
    ) -> Result<Self, DomainError> {
        let mut tls = (*tls_config).clone();
        tls.alpn_protocols = vec![b"doq".to_vec()];
        let quic_tls = QuicClientConfig::try_from(tls)
            .map_err(|e| DomainError::IoError(format!("QUIC TLS config: {e}")))?;
        Ok(Self {
            server_addr,
            server_name,
            client_config: QuinnClientConfig::new(Arc::new(quic_tls)),
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<quinn::Connection, DomainError> {
        let mut guard = self.connection.lock().await;
        if let Some((_, conn)) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        let bind: SocketAddr = if self.server_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let mut endpoint = Endpoint::client(bind)
            .map_err(|e| DomainError::IoError(format!("QUIC endpoint: {e}")))?;
        endpoint.set_default_client_config(self.client_config.clone());

        let conn = endpoint
            .connect(self.server_addr, &self.server_name)
            .map_err(|e| DomainError::IoError(format!("QUIC connect {}: {e}", self.server_addr)))?
            .await
            .map_err(|e| DomainError::IoError(format!("QUIC handshake {}: {e}", self.server_addr)))?;
        debug!(server = %self.server_addr, "DoQ connection established");

        *guard = Some((endpoint, conn.clone()));
        Ok(conn)
    }
}

#[async_trait]
impl DnsTransport for QuicTransport {
    async fn send(
        &self,
        message_bytes: &[u8],
        timeout: Duration,
    ) -> Result<TransportResponse, DomainError> {
        let exchange = async {
            let conn = self.connection().await?;
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| DomainError::IoError(format!("DoQ stream: {e}")))?;

            let len = (message_bytes.len() as u16).to_be_bytes();
            send.write_all(&len)
                .await
                .map_err(|e| DomainError::IoError(format!("DoQ send: {e}")))?;
            send.write_all(message_bytes)
                .await
                .map_err(|e| DomainError::IoError(format!("DoQ send: {e}")))?;
            send.finish()
                .map_err(|e| DomainError::IoError(format!("DoQ finish: {e}")))?;

            let mut len_buf = [0u8; 2];
            recv.read_exact(&mut len_buf)
                .await
                .map_err(|e| DomainError::IoError(format!("DoQ receive: {e}")))?;
            let mut bytes = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            recv.read_exact(&mut bytes)
                .await
                .map_err(|e| DomainError::IoError(format!("DoQ receive: {e}")))?;

            Ok(TransportResponse { bytes })
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DomainError::QueryTimeout)?
    }

    fn protocol_name(&self) -> &'static str {
        "QUIC"
    }
}
