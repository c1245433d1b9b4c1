use homegate_domain::DomainError;
use std::net::IpAddr;

/// Host-OS capability: does the interface carry a statically configured
/// address? The DHCP core only asks the question; mutating the interface is
/// an adapter concern.
pub trait StaticIpCheck: Send + Sync {
    fn has_static_ip(&self, iface: &str) -> Result<bool, DomainError>;
}

/// Reverse lookup of client hostnames, backed by the DHCP lease table.
///
/// The only state shared between the two cores: the DNS forwarder consults
/// this for PTR questions about local clients.
pub trait ClientNameSource: Send + Sync {
    fn hostname_for_ip(&self, ip: IpAddr) -> Option<String>;
}
