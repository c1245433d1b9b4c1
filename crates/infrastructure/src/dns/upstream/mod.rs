//! Upstream resolvers: the tagged transport variants, bootstrap resolution
//! and the dispatch pool.

pub mod bootstrap;
pub mod conn_pool;
pub mod pool;
pub mod transport;

use crate::dns::message;
use bootstrap::{upstream_tls_config, Bootstrapper};
use homegate_domain::{DomainError, UpstreamSpec, UpstreamTransport};
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use transport::Transport;

/// Decay factor for the running RTT estimate: heavier weight on history.
const RTT_DECAY: f64 = 0.7;

/// One configured upstream with its lazily-dialed transport and a decayed
/// RTT estimate feeding load-balanced dispatch.
pub struct Upstream {
    spec: UpstreamSpec,
    display: Arc<str>,
    transport: tokio::sync::OnceCell<Transport>,
    /// Decayed RTT in microseconds; f64 bits stored atomically.
    rtt_us: AtomicU64,
}

impl Upstream {
    pub fn new(spec: UpstreamSpec) -> Self {
        let display: Arc<str> = Arc::from(spec.to_string());
        Self {
            spec,
            display,
            transport: tokio::sync::OnceCell::new(),
            rtt_us: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn display(&self) -> Arc<str> {
        Arc::clone(&self.display)
    }

    pub fn spec(&self) -> &UpstreamSpec {
        &self.spec
    }

    pub fn rtt_us(&self) -> f64 {
        f64::from_bits(self.rtt_us.load(Ordering::Relaxed))
    }

    fn observe_rtt(&self, sample_us: f64) {
        let old = self.rtt_us();
        let new = if old == 0.0 {
            sample_us
        } else {
            old * RTT_DECAY + sample_us * (1.0 - RTT_DECAY)
        };
        self.rtt_us.store(new.to_bits(), Ordering::Relaxed);
    }

    /// Errors count as a full-timeout observation so the upstream sinks in
    /// the load-balance ordering.
    fn penalize(&self, timeout: Duration) {
        self.observe_rtt(timeout.as_micros() as f64);
    }

    async fn resolved_addr(&self, bootstrap: &Bootstrapper) -> Result<SocketAddr, DomainError> {
        if let Some(addr) = self.spec.socket_addr() {
            return Ok(addr);
        }
        let ip = bootstrap.resolve(&self.spec.host).await?;
        Ok(SocketAddr::new(ip, self.spec.port))
    }

    async fn build_transport(&self, bootstrap: &Bootstrapper) -> Result<Transport, DomainError> {
        match self.spec.transport {
            UpstreamTransport::Udp => Ok(Transport::Udp(transport::udp::UdpTransport::new(
                self.resolved_addr(bootstrap).await?,
            ))),
            UpstreamTransport::Tcp => Ok(Transport::Tcp(transport::tcp::TcpTransport::new(
                self.resolved_addr(bootstrap).await?,
            ))),
            #[cfg(feature = "dns-over-rustls")]
            UpstreamTransport::Tls => {
                let addr = self.resolved_addr(bootstrap).await?;
                let server_name = ServerName::try_from(self.spec.server_name().to_string())
                    .map_err(|e| {
                        DomainError::InvalidConfig(format!(
                            "bad TLS server name '{}': {e}",
                            self.spec.host
                        ))
                    })?;
                Ok(Transport::Tls(transport::tls::TlsTransport::new(
                    addr,
                    server_name,
                    upstream_tls_config(),
                )))
            }
            #[cfg(feature = "dns-over-https")]
            UpstreamTransport::Https => {
                let resolved = if self.spec.needs_bootstrap() {
                    Some(self.resolved_addr(bootstrap).await?)
                } else {
                    self.spec.socket_addr()
                };
                Ok(Transport::Https(transport::https::HttpsTransport::new(
                    self.spec.url(),
                    &self.spec.host,
                    resolved,
                )?))
            }
            #[cfg(feature = "dns-over-quic")]
            UpstreamTransport::Quic => {
                let addr = self.resolved_addr(bootstrap).await?;
                Ok(Transport::Quic(transport::quic::QuicTransport::new(
                    addr,
                    self.spec.server_name().to_string(),
                    upstream_tls_config(),
                )?))
            }
            #[allow(unreachable_patterns)]
            other => Err(DomainError::InvalidConfig(format!(
                "transport {other:?} disabled at build time"
            ))),
        }
    }

    async fn transport(&self, bootstrap: &Bootstrapper) -> Result<&Transport, DomainError> {
        self.transport
            .get_or_try_init(|| self.build_transport(bootstrap))
            .await
    }

    /// Exchange one query. Truncated UDP answers are retried over TCP
    /// within the remaining budget.
    pub async fn exchange(
        &self,
        query_bytes: &[u8],
        timeout: Duration,
        bootstrap: &Bootstrapper,
    ) -> Result<ExchangeReply, DomainError> {
        let start = Instant::now();
        let transport = self.transport(bootstrap).await.inspect_err(|_| {
            self.penalize(timeout);
        })?;

        let result = async {
            let raw = transport.send(query_bytes, timeout).await?;
            let mut response = message::parse(&raw.bytes)?;

            if response.truncated() {
                if let Transport::Udp(_) = transport {
                    if let Some(addr) = self.spec.socket_addr() {
                        debug!(server = %self.display, "Truncated UDP answer, retrying over TCP");
                        let remaining = timeout
                            .checked_sub(start.elapsed())
                            .unwrap_or(Duration::from_millis(500));
                        let tcp = transport::tcp::TcpTransport::new(addr);
                        let raw =
                            transport::DnsTransport::send(&tcp, query_bytes, remaining).await?;
                        response = message::parse(&raw.bytes)?;
                    }
                }
            }
            Ok(response)
        }
        .await;

        match result {
            Ok(response) => {
                let elapsed = start.elapsed();
                self.observe_rtt(elapsed.as_micros() as f64);
                Ok(ExchangeReply {
                    response,
                    latency: elapsed,
                })
            }
            Err(e) => {
                self.penalize(timeout);
                Err(e)
            }
        }
    }
}

/// A successful upstream exchange.
pub struct ExchangeReply {
    pub response: Message,
    pub latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_decay_converges() {
        let upstream = Upstream::new("8.8.8.8".parse().unwrap());
        assert_eq!(upstream.rtt_us(), 0.0);
        upstream.observe_rtt(1000.0);
        assert_eq!(upstream.rtt_us(), 1000.0);
        upstream.observe_rtt(2000.0);
        let rtt = upstream.rtt_us();
        assert!(rtt > 1000.0 && rtt < 2000.0);
    }

    #[test]
    fn penalty_raises_estimate() {
        let upstream = Upstream::new("8.8.8.8".parse().unwrap());
        upstream.observe_rtt(500.0);
        upstream.penalize(Duration::from_secs(5));
        assert!(upstream.rtt_us() > 500.0);
    }
}
