use super::{DnsTransport, TransportResponse};
use async_trait::async_trait;
use homegate_domain::DomainError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// DNS over TCP: two-byte length prefix framing per RFC 1035 §4.2.2.
pub struct TcpTransport {
    server_addr: SocketAddr,
}

impl TcpTransport {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self { server_addr }
    }
}

/// Write one framed message to `stream`.
pub(crate) async fn write_framed<S>(stream: &mut S, message: &[u8]) -> std::io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let len = (message.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(message).await?;
    stream.flush().await
}

/// Read one framed message from `stream`.
pub(crate) async fn read_framed<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl DnsTransport for TcpTransport {
    async fn send(
        &self,
        message_bytes: &[u8],
        timeout: Duration,
    ) -> Result<TransportResponse, DomainError> {
        let exchange = async {
            let mut stream = TcpStream::connect(self.server_addr)
                .await
                .map_err(|e| DomainError::IoError(format!("connect {}: {e}", self.server_addr)))?;
            write_framed(&mut stream, message_bytes)
                .await
                .map_err(|e| DomainError::IoError(format!("send to {}: {e}", self.server_addr)))?;
            let bytes = read_framed(&mut stream).await.map_err(|e| {
                DomainError::IoError(format!("receive from {}: {e}", self.server_addr))
            })?;
            debug!(server = %self.server_addr, bytes = bytes.len(), "TCP response received");
            Ok(TransportResponse { bytes })
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DomainError::QueryTimeout)?
    }

    fn protocol_name(&self) -> &'static str {
        "TCP"
    }
}
