//! Network-interface enumeration for the DHCP core.

use homegate_domain::{DomainError, MacAddr};
use std::net::{Ipv4Addr, Ipv6Addr};

/// What the DHCP server needs to know about its interface.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl InterfaceInfo {
    /// The server identifier: the interface's first IPv4 address.
    pub fn first_ipv4(&self) -> Result<Ipv4Addr, DomainError> {
        self.ipv4
            .first()
            .copied()
            .ok_or_else(|| DomainError::InvalidConfig(format!("{} has no IPv4 address", self.name)))
    }
}

#[cfg(unix)]
pub fn interface_info(name: &str) -> Result<InterfaceInfo, DomainError> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::if_nametoindex;

    let index = if_nametoindex(name)
        .map_err(|_| DomainError::UnknownInterface(name.to_string()))?;

    let mut mac = None;
    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();

    let addrs =
        getifaddrs().map_err(|e| DomainError::IoError(format!("getifaddrs: {e}")))?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(link) = address.as_link_addr() {
            if let Some(bytes) = link.addr() {
                mac = Some(MacAddr(bytes));
            }
        } else if let Some(sin) = address.as_sockaddr_in() {
            ipv4.push(sin.ip());
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            ipv6.push(sin6.ip());
        }
    }

    let mac = mac.ok_or_else(|| {
        DomainError::UnknownInterface(format!("{name}: no hardware address"))
    })?;

    Ok(InterfaceInfo {
        name: name.to_string(),
        index,
        mac,
        ipv4,
        ipv6,
    })
}

#[cfg(not(unix))]
pub fn interface_info(name: &str) -> Result<InterfaceInfo, DomainError> {
    Err(DomainError::UnknownInterface(name.to_string()))
}
