use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Sentinel expiry marking a lease as static: never expires, never reclaimed.
pub const STATIC_LEASE_EXPIRY: i64 = 1;

/// A six-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for slot in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| DomainError::InvalidMacAddress(s.to_string()))?;
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| DomainError::InvalidMacAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(DomainError::InvalidMacAddress(s.to_string()));
        }
        Ok(MacAddr(bytes))
    }
}

impl TryFrom<&[u8]> for MacAddr {
    type Error = DomainError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 6] = value
            .try_into()
            .map_err(|_| DomainError::InvalidMacAddress(format!("{} bytes", value.len())))?;
        Ok(MacAddr(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which kinds of leases a `leases()` query should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMask {
    Dynamic,
    Static,
    All,
}

/// An association between a hardware address, an IP and an expiry time.
///
/// `expiry == STATIC_LEASE_EXPIRY` marks the lease static. `expiry == 0`
/// marks a lease that was allocated but never committed; the store skips it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub mac: MacAddr,
    pub ip: IpAddr,
    #[serde(default)]
    pub hostname: String,
    pub expiry: i64,
}

impl Lease {
    pub fn new_static(mac: MacAddr, ip: IpAddr, hostname: String) -> Self {
        Self {
            mac,
            ip,
            hostname,
            expiry: STATIC_LEASE_EXPIRY,
        }
    }

    pub fn is_static(&self) -> bool {
        self.expiry == STATIC_LEASE_EXPIRY
    }

    pub fn is_expired(&self, now: i64) -> bool {
        !self.is_static() && self.expiry <= now
    }

    pub fn matches_mask(&self, mask: LeaseMask) -> bool {
        match mask {
            LeaseMask::All => true,
            LeaseMask::Static => self.is_static(),
            LeaseMask::Dynamic => !self.is_static(),
        }
    }

    /// Structural validation used by the control plane before any mutation.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.mac.is_zero() {
            return Err(DomainError::InvalidMacAddress("all-zero".into()));
        }
        if self.ip.is_unspecified() {
            return Err(DomainError::InvalidIpAddress(self.ip.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trip() {
        let mac: MacAddr = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn mac_rejects_garbage() {
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn static_sentinel() {
        let lease = Lease::new_static(MacAddr([2; 6]), "10.0.0.5".parse().unwrap(), String::new());
        assert!(lease.is_static());
        assert!(!lease.is_expired(i64::MAX));
        assert!(lease.matches_mask(LeaseMask::Static));
        assert!(!lease.matches_mask(LeaseMask::Dynamic));
    }

    #[test]
    fn zero_mac_invalid() {
        let lease = Lease::new_static(MacAddr::ZERO, "10.0.0.5".parse().unwrap(), String::new());
        assert!(lease.validate().is_err());
    }
}
