use crate::access::ClientMatcher;
use crate::filtering::BlockingMode;
use crate::upstream::{UpstreamPolicy, UpstreamSpec};
use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// A static rewrite rule: `domain` (exact or `*.` wildcard) answered with
/// either an IP literal or a canonical name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    pub domain: String,
    pub answer: String,
}

/// One blocklist source: a numeric id (reported in filtering results) plus a
/// file of adblock-syntax rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterListConfig {
    pub id: i64,
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// DNS forwarder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_bind")]
    pub bind_host: IpAddr,

    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Optional DNS-over-TLS listener port; requires `tls_cert` + `tls_key`.
    #[serde(default)]
    pub tls_port: Option<u16>,

    /// Optional DNS-over-QUIC listener port.
    #[serde(default)]
    pub quic_port: Option<u16>,

    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub protection_enabled: bool,

    #[serde(default)]
    pub blocking_mode: BlockingMode,

    #[serde(default)]
    pub blocking_ipv4: Option<Ipv4Addr>,

    #[serde(default)]
    pub blocking_ipv6: Option<Ipv6Addr>,

    #[serde(default = "default_blocked_ttl")]
    pub blocked_response_ttl: u32,

    #[serde(default = "default_parental_host")]
    pub parental_block_host: String,

    #[serde(default = "default_safebrowsing_host")]
    pub safe_browsing_block_host: String,

    /// Queries per second per client; 0 disables rate limiting.
    #[serde(default = "default_ratelimit")]
    pub ratelimit: u32,

    #[serde(default)]
    pub ratelimit_whitelist: Vec<String>,

    #[serde(default)]
    pub refuse_any: bool,

    #[serde(default = "default_upstreams")]
    pub upstream_dns: Vec<String>,

    /// Extra upstreams read one-per-line from a file, merged with
    /// `upstream_dns` at startup.
    #[serde(default)]
    pub upstream_dns_file: Option<PathBuf>,

    #[serde(default = "default_bootstrap")]
    pub bootstrap_dns: Vec<String>,

    /// Broadcast each query to all upstreams, first answer wins.
    #[serde(default)]
    pub all_servers: bool,

    /// Broadcast and return the answer whose address probes fastest.
    #[serde(default)]
    pub fastest_addr: bool,

    #[serde(default)]
    pub allowed_clients: Vec<String>,

    #[serde(default)]
    pub disallowed_clients: Vec<String>,

    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    /// Response cache capacity in entries; 0 disables the cache.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default)]
    pub cache_min_ttl: u32,

    #[serde(default = "default_cache_max_ttl")]
    pub cache_max_ttl: u32,

    /// Answers containing these IPs are rewritten to NXDOMAIN.
    #[serde(default)]
    pub bogus_nxdomain: Vec<IpAddr>,

    #[serde(default)]
    pub aaaa_disabled: bool,

    /// Set the DO bit on forwarded queries and pass validation data through.
    #[serde(default)]
    pub enable_dnssec: bool,

    #[serde(default)]
    pub edns_client_subnet: bool,

    /// Upper bound on concurrently processed requests.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    /// `DOMAIN[,DOMAIN…]/IPSET[,IPSET…]` bindings.
    #[serde(default)]
    pub ipset: Vec<String>,

    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_ms: u64,

    #[serde(default)]
    pub filters: Vec<FilterListConfig>,

    /// Inline adblock-syntax rules, highest precedence.
    #[serde(default)]
    pub user_rules: Vec<String>,

    /// `ip host [host…]` lines answered locally.
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,

    #[serde(default)]
    pub safe_search_enabled: bool,

    #[serde(default)]
    pub safe_browsing_enabled: bool,

    #[serde(default)]
    pub parental_enabled: bool,

    /// Domains answered with the safe-browsing block host.
    #[serde(default)]
    pub safe_browsing_domains: Vec<String>,

    /// Domains answered with the parental block host.
    #[serde(default)]
    pub parental_domains: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        // serde defaults and Default must agree; deserialize the empty table.
        toml::from_str("").expect("empty DnsConfig")
    }
}

impl DnsConfig {
    pub fn upstream_policy(&self) -> UpstreamPolicy {
        if self.fastest_addr {
            UpstreamPolicy::FastestAddr
        } else if self.all_servers {
            UpstreamPolicy::Parallel
        } else {
            UpstreamPolicy::LoadBalance
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.upstream_dns.is_empty() && self.upstream_dns_file.is_none() {
            return Err(DomainError::InvalidConfig(
                "at least one upstream must be configured".into(),
            ));
        }
        for addr in &self.upstream_dns {
            let spec: UpstreamSpec = addr.parse()?;
            if spec.needs_bootstrap() && self.bootstrap_dns.is_empty() {
                return Err(DomainError::InvalidConfig(format!(
                    "upstream '{addr}' is addressed by name and needs bootstrap_dns"
                )));
            }
        }
        for addr in &self.bootstrap_dns {
            let spec: UpstreamSpec = addr.parse()?;
            if spec.transport.is_encrypted() {
                return Err(DomainError::InvalidConfig(format!(
                    "bootstrap resolver '{addr}' must be plain DNS"
                )));
            }
        }
        if self.blocking_mode == BlockingMode::CustomIp
            && self.blocking_ipv4.is_none()
            && self.blocking_ipv6.is_none()
        {
            return Err(DomainError::InvalidConfig(
                "blocking_mode = custom_ip requires blocking_ipv4 or blocking_ipv6".into(),
            ));
        }
        if self.cache_max_ttl != 0 && self.cache_min_ttl > self.cache_max_ttl {
            return Err(DomainError::InvalidConfig(
                "cache_min_ttl exceeds cache_max_ttl".into(),
            ));
        }
        if (self.tls_port.is_some() || self.quic_port.is_some())
            && (self.tls_cert.is_none() || self.tls_key.is_none())
        {
            return Err(DomainError::InvalidConfig(
                "tls_port/quic_port require tls_cert and tls_key".into(),
            ));
        }
        ClientMatcher::compile(&self.allowed_clients)?;
        ClientMatcher::compile(&self.disallowed_clients)?;
        ClientMatcher::compile(&self.ratelimit_whitelist)?;
        Ok(())
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_dns_port() -> u16 {
    53
}

fn default_true() -> bool {
    true
}

fn default_blocked_ttl() -> u32 {
    3600
}

fn default_parental_host() -> String {
    "family-block.homegate.invalid".to_string()
}

fn default_safebrowsing_host() -> String {
    "standard-block.homegate.invalid".to_string()
}

fn default_ratelimit() -> u32 {
    20
}

fn default_upstreams() -> Vec<String> {
    vec!["8.8.8.8:53".to_string(), "1.1.1.1:53".to_string()]
}

fn default_bootstrap() -> Vec<String> {
    vec!["9.9.9.10".to_string()]
}

fn default_cache_size() -> usize {
    4096
}

fn default_cache_max_ttl() -> u32 {
    0
}

fn default_max_inflight() -> usize {
    300
}

fn default_upstream_timeout() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DnsConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.protection_enabled);
        assert_eq!(config.blocked_response_ttl, 3600);
        assert_eq!(config.upstream_policy(), UpstreamPolicy::LoadBalance);
    }

    #[test]
    fn named_encrypted_upstream_requires_bootstrap() {
        let mut config = DnsConfig::default();
        config.upstream_dns = vec!["tls://dns.quad9.net".into()];
        config.bootstrap_dns.clear();
        assert!(config.validate().is_err());
        config.bootstrap_dns = vec!["9.9.9.10".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_ip_mode_needs_an_ip() {
        let mut config = DnsConfig::default();
        config.blocking_mode = BlockingMode::CustomIp;
        assert!(config.validate().is_err());
        config.blocking_ipv4 = Some("10.0.0.10".parse().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn policy_flags() {
        let mut config = DnsConfig::default();
        config.all_servers = true;
        assert_eq!(config.upstream_policy(), UpstreamPolicy::Parallel);
        config.fastest_addr = true;
        assert_eq!(config.upstream_policy(), UpstreamPolicy::FastestAddr);
    }
}
