use super::tcp::{read_framed, write_framed};
use super::{DnsTransport, TransportResponse};
use crate::dns::upstream::conn_pool::ConnPool;
use async_trait::async_trait;
use homegate_domain::DomainError;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const MAX_IDLE_CONNECTIONS: usize = 4;

/// DNS over TLS with an idle-connection stack.
///
/// A pooled connection that fails mid-exchange is dropped and the query is
/// retried once over a fresh dial.
pub struct TlsTransport {
    server_addr: SocketAddr,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
    pool: ConnPool<TlsStream<TcpStream>>,
}

impl TlsTransport {
    pub fn new(
        server_addr: SocketAddr,
        server_name: ServerName<'static>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            server_addr,
            server_name,
            config,
            pool: ConnPool::new(MAX_IDLE_CONNECTIONS),
        }
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>, DomainError> {
        let tcp = TcpStream::connect(self.server_addr)
            .await
            .map_err(|e| DomainError::IoError(format!("connect {}: {e}", self.server_addr)))?;
        let connector = TlsConnector::from(Arc::clone(&self.config));
        let stream = connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| DomainError::IoError(format!("TLS handshake {}: {e}", self.server_addr)))?;
        debug!(server = %self.server_addr, "DoT connection established");
        Ok(stream)
    }

    async fn exchange_on(
        stream: &mut TlsStream<TcpStream>,
        message_bytes: &[u8],
    ) -> std::io::Result<Vec<u8>> {
        write_framed(stream, message_bytes).await?;
        read_framed(stream).await
    }
}

#[async_trait]
impl DnsTransport for TlsTransport {
    async fn send(
        &self,
        message_bytes: &[u8],
        timeout: Duration,
    ) -> Result<TransportResponse, DomainError> {
        let exchange = async {
            if let Some(mut stream) = self.pool.get() {
                match Self::exchange_on(&mut stream, message_bytes).await {
                    Ok(bytes) => {
                        self.pool.put(stream);
                        return Ok(TransportResponse { bytes });
                    }
                    Err(e) => {
                        debug!(server = %self.server_addr, error = %e, "Pooled DoT connection stale, redialing");
                    }
                }
            }
            let mut stream = self.dial().await?;
            let bytes = Self::exchange_on(&mut stream, message_bytes)
                .await
                .map_err(|e| DomainError::IoError(format!("DoT exchange {}: {e}", self.server_addr)))?;
            self.pool.put(stream);
            Ok(TransportResponse { bytes })
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DomainError::QueryTimeout)?
    }

    fn protocol_name(&self) -> &'static str {
        "TLS"
    }
}
