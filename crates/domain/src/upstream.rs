use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// How queries are spread over the upstreams of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamPolicy {
    /// Pick the upstream with the lowest decayed RTT.
    #[default]
    LoadBalance,
    /// Race every upstream, first successful answer wins.
    Parallel,
    /// Race every upstream, return the answer whose IP probes fastest.
    FastestAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamTransport {
    Udp,
    Tcp,
    Tls,
    Https,
    Quic,
}

impl UpstreamTransport {
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Udp | Self::Tcp => 53,
            Self::Tls | Self::Quic => 853,
            Self::Https => 443,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls | Self::Https | Self::Quic)
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Https => "https",
            Self::Quic => "quic",
        }
    }
}

/// An addressable upstream resolver.
///
/// Parsed from the address syntax the configuration uses:
/// `8.8.8.8`, `8.8.8.8:53`, `tcp://9.9.9.9`, `tls://dns.quad9.net`,
/// `https://dns.google/dns-query`, `quic://dns.adguard-dns.com`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamSpec {
    pub transport: UpstreamTransport,
    /// Hostname or IP literal of the resolver.
    pub host: String,
    pub port: u16,
    /// DoH request path, e.g. `/dns-query`.
    pub path: Option<String>,
}

impl UpstreamSpec {
    /// Socket address when the host is an IP literal, `None` for names.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Encrypted upstreams addressed by name must be resolved through a
    /// bootstrap resolver before first use.
    pub fn needs_bootstrap(&self) -> bool {
        self.transport.is_encrypted() && self.host.parse::<IpAddr>().is_err()
    }

    /// TLS server name presented during the handshake.
    pub fn server_name(&self) -> &str {
        &self.host
    }

    /// Full DoH URL for HTTPS upstreams.
    pub fn url(&self) -> String {
        let path = self.path.as_deref().unwrap_or("/dns-query");
        if self.port == 443 {
            format!("https://{}{}", self.host, path)
        } else {
            format!("https://{}:{}{}", self.host, self.port, path)
        }
    }

    fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16), DomainError> {
        // Bracketed IPv6 literal: [::1]:53
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| DomainError::InvalidConfig(format!("bad address '{s}'")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| DomainError::InvalidConfig(format!("bad port in '{s}'")))?,
                None => default_port,
            };
            return Ok((host.to_string(), port));
        }
        // Unbracketed IPv6 literal has multiple colons and no port.
        if s.matches(':').count() > 1 {
            return Ok((s.to_string(), default_port));
        }
        match s.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| DomainError::InvalidConfig(format!("bad port in '{s}'")))?;
                Ok((host.to_string(), port))
            }
            None => Ok((s.to_string(), default_port)),
        }
    }
}

impl FromStr for UpstreamSpec {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::InvalidConfig("empty upstream address".into()));
        }

        let (transport, rest) = match s.split_once("://") {
            Some(("udp", rest)) => (UpstreamTransport::Udp, rest),
            Some(("tcp", rest)) => (UpstreamTransport::Tcp, rest),
            Some(("tls", rest)) => (UpstreamTransport::Tls, rest),
            Some(("https", rest)) => (UpstreamTransport::Https, rest),
            Some(("quic", rest)) => (UpstreamTransport::Quic, rest),
            Some((scheme, _)) => {
                return Err(DomainError::InvalidConfig(format!(
                    "unknown upstream scheme '{scheme}'"
                )))
            }
            None => (UpstreamTransport::Udp, s),
        };

        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, Some(format!("/{p}"))),
            None => (rest, None),
        };
        if path.is_some() && transport != UpstreamTransport::Https {
            return Err(DomainError::InvalidConfig(format!(
                "path only valid for https upstreams: '{s}'"
            )));
        }

        let (host, port) = Self::split_host_port(authority, transport.default_port())?;
        if host.is_empty() {
            return Err(DomainError::InvalidConfig(format!("empty host in '{s}'")));
        }

        Ok(UpstreamSpec {
            transport,
            host,
            port,
            path,
        })
    }
}

impl fmt::Display for UpstreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            UpstreamTransport::Udp => {
                if self.port == 53 {
                    write!(f, "{}", self.host)
                } else {
                    write!(f, "{}:{}", self.host, self.port)
                }
            }
            UpstreamTransport::Https => write!(f, "{}", self.url()),
            t => {
                if self.port == t.default_port() {
                    write!(f, "{}://{}", t.scheme(), self.host)
                } else {
                    write!(f, "{}://{}:{}", t.scheme(), self.host, self.port)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_ip() {
        let u: UpstreamSpec = "8.8.8.8".parse().unwrap();
        assert_eq!(u.transport, UpstreamTransport::Udp);
        assert_eq!(u.port, 53);
        assert_eq!(u.socket_addr().unwrap().to_string(), "8.8.8.8:53");
        assert!(!u.needs_bootstrap());
    }

    #[test]
    fn parses_tls_name() {
        let u: UpstreamSpec = "tls://dns.quad9.net".parse().unwrap();
        assert_eq!(u.transport, UpstreamTransport::Tls);
        assert_eq!(u.port, 853);
        assert!(u.needs_bootstrap());
        assert_eq!(u.server_name(), "dns.quad9.net");
    }

    #[test]
    fn parses_doh_url() {
        let u: UpstreamSpec = "https://dns.google/dns-query".parse().unwrap();
        assert_eq!(u.transport, UpstreamTransport::Https);
        assert_eq!(u.url(), "https://dns.google/dns-query");
    }

    #[test]
    fn parses_ipv6_literal() {
        let u: UpstreamSpec = "[2620:fe::fe]:53".parse().unwrap();
        assert_eq!(u.host, "2620:fe::fe");
        assert!(u.socket_addr().is_some());
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("sdns://abc".parse::<UpstreamSpec>().is_err());
    }
}
