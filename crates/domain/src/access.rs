use crate::DomainError;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Client access rules plus hostname patterns refused outright.
///
/// `allowed_clients`, when non-empty, turns into an allowlist: everything not
/// listed is refused. `disallowed_clients` is consulted otherwise.
/// `blocked_hosts` holds adblock-syntax patterns matched against the QNAME.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    pub allowed_clients: Vec<String>,
    pub disallowed_clients: Vec<String>,
    pub blocked_hosts: Vec<String>,
}

/// Compiled client list: literal IPs plus CIDR networks.
#[derive(Debug, Clone, Default)]
pub struct ClientMatcher {
    ips: Vec<IpAddr>,
    nets: Vec<IpNetwork>,
}

impl ClientMatcher {
    /// Compile a list of `ip` / `cidr` strings. Entries that parse as
    /// neither are a configuration error.
    pub fn compile(entries: &[String]) -> Result<Self, DomainError> {
        let mut ips = Vec::new();
        let mut nets = Vec::new();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Ok(ip) = entry.parse::<IpAddr>() {
                ips.push(ip);
            } else if let Ok(net) = entry.parse::<IpNetwork>() {
                nets.push(net);
            } else {
                return Err(DomainError::InvalidConfig(format!(
                    "not an IP or CIDR: '{entry}'"
                )));
            }
        }
        Ok(Self { ips, nets })
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.nets.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip) || self.nets.iter().any(|n| n.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_cidr() {
        let m = ClientMatcher::compile(&["192.168.1.5".into(), "10.0.0.0/8".into()]).unwrap();
        assert!(m.contains("192.168.1.5".parse().unwrap()));
        assert!(m.contains("10.3.4.5".parse().unwrap()));
        assert!(!m.contains("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn rejects_garbage_entry() {
        assert!(ClientMatcher::compile(&["not-an-ip".into()]).is_err());
    }

    #[test]
    fn empty_matcher_matches_nothing() {
        let m = ClientMatcher::compile(&[]).unwrap();
        assert!(m.is_empty());
        assert!(!m.contains("127.0.0.1".parse().unwrap()));
    }
}
