use super::{DnsTransport, TransportResponse};
use async_trait::async_trait;
use homegate_domain::DomainError;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// DNS over HTTPS: HTTP/2 POST of `application/dns-message` bodies.
///
/// The reqwest client keeps its own connection pool; when the upstream host
/// was bootstrap-resolved the address is pinned so no system resolver is
/// consulted.
pub struct HttpsTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpsTransport {
    pub fn new(url: String, host: &str, resolved: Option<SocketAddr>) -> Result<Self, DomainError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .http2_prior_knowledge();
        if let Some(addr) = resolved {
            builder = builder.resolve(host, addr);
        }
        let client = builder
            .build()
            .map_err(|e| DomainError::IoError(format!("build DoH client: {e}")))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl DnsTransport for HttpsTransport {
    async fn send(
        &self,
        message_bytes: &[u8],
        timeout: Duration,
    ) -> Result<TransportResponse, DomainError> {
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(message_bytes.to_vec())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DomainError::QueryTimeout
                } else {
                    DomainError::IoError(format!("DoH request {}: {e}", self.url))
                }
            })?;

        if !response.status().is_success() {
            return Err(DomainError::InvalidDnsResponse(format!(
                "DoH {} answered HTTP {}",
                self.url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DomainError::IoError(format!("DoH body {}: {e}", self.url)))?;
        debug!(url = %self.url, bytes = bytes.len(), "DoH response received");

        Ok(TransportResponse {
            bytes: bytes.to_vec(),
        })
    }

    fn protocol_name(&self) -> &'static str {
        "HTTPS"
    }
}
