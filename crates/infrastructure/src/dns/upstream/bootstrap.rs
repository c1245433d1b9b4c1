use crate::dns::message;
use crate::dns::upstream::transport::udp::UdpTransport;
use crate::dns::upstream::transport::DnsTransport;
use dashmap::DashMap;
use homegate_domain::{DomainError, UpstreamSpec};
use hickory_proto::rr::{RData, RecordType};
use rustc_hash::FxBuildHasher;
use rustls::ClientConfig;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(3);

/// TLS client configuration shared by every encrypted upstream: webpki
/// roots, no client auth. Built once.
pub fn upstream_tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    Arc::clone(CONFIG.get_or_init(|| {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }))
}

/// Resolves the hostnames of encrypted upstreams over plain DNS.
///
/// The first successful resolution of a host is memoized; together with the
/// shared TLS configuration this pins each upstream to one address for the
/// lifetime of the configuration.
pub struct Bootstrapper {
    resolvers: Vec<SocketAddr>,
    cache: DashMap<String, IpAddr, FxBuildHasher>,
}

impl Bootstrapper {
    pub fn new(addresses: &[String]) -> Result<Self, DomainError> {
        let mut resolvers = Vec::new();
        for addr in addresses {
            let spec: UpstreamSpec = addr.parse()?;
            let socket = spec.socket_addr().ok_or_else(|| {
                DomainError::InvalidConfig(format!("bootstrap resolver '{addr}' must be an IP"))
            })?;
            resolvers.push(socket);
        }
        Ok(Self {
            resolvers,
            cache: DashMap::with_hasher(FxBuildHasher),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    async fn query_one(
        &self,
        resolver: SocketAddr,
        host: &str,
        rtype: RecordType,
    ) -> Result<Option<IpAddr>, DomainError> {
        let fqdn = format!("{}.", host.trim_end_matches('.'));
        let query = message::build_query(&fqdn, rtype, false, None)?;
        let transport = UdpTransport::new(resolver);
        let response = transport.send(&query, BOOTSTRAP_TIMEOUT).await?;
        let parsed = message::parse(&response.bytes)?;
        Ok(parsed.answers().iter().find_map(|r| match r.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        }))
    }

    /// Resolve `host`, preferring A over AAAA, trying every bootstrap
    /// resolver in order. Memoized on first success.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, DomainError> {
        if let Some(cached) = self.cache.get(host) {
            return Ok(*cached);
        }

        for resolver in &self.resolvers {
            for rtype in [RecordType::A, RecordType::AAAA] {
                match self.query_one(*resolver, host, rtype).await {
                    Ok(Some(ip)) => {
                        info!(host, %ip, bootstrap = %resolver, "Bootstrap resolution memoized");
                        self.cache.insert(host.to_string(), ip);
                        return Ok(ip);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(host, bootstrap = %resolver, error = %e, "Bootstrap query failed");
                    }
                }
            }
        }

        Err(DomainError::IoError(format!(
            "bootstrap resolution of '{host}' failed"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_named_bootstrap() {
        assert!(Bootstrapper::new(&["dns.example.com".to_string()]).is_err());
    }

    #[test]
    fn accepts_ip_bootstrap() {
        let bootstrapper = Bootstrapper::new(&["9.9.9.10".to_string()]).unwrap();
        assert!(!bootstrapper.is_empty());
    }
}
