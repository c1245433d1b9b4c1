use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// A raw DHCPv4 option declared in the configuration as `CODE TYPE VALUE`,
/// TYPE ∈ {`hex`, `ip`}. Example: `252 ip 192.168.1.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl RawDhcpOption {
    pub fn parse(line: &str) -> Result<Self, DomainError> {
        let mut parts = line.split_whitespace();
        let code = parts
            .next()
            .and_then(|c| c.parse::<u8>().ok())
            .ok_or_else(|| DomainError::InvalidConfig(format!("bad option code in '{line}'")))?;
        let kind = parts
            .next()
            .ok_or_else(|| DomainError::InvalidConfig(format!("missing option type in '{line}'")))?;
        let value = parts
            .next()
            .ok_or_else(|| DomainError::InvalidConfig(format!("missing option value in '{line}'")))?;
        if parts.next().is_some() {
            return Err(DomainError::InvalidConfig(format!(
                "trailing data in option '{line}'"
            )));
        }

        let data = match kind {
            "hex" => {
                if value.len() % 2 != 0 {
                    return Err(DomainError::InvalidConfig(format!(
                        "odd-length hex value in '{line}'"
                    )));
                }
                (0..value.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&value[i..i + 2], 16))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| {
                        DomainError::InvalidConfig(format!("bad hex value in '{line}'"))
                    })?
            }
            "ip" => {
                let ip: Ipv4Addr = value.parse().map_err(|_| {
                    DomainError::InvalidConfig(format!("bad IP value in '{line}'"))
                })?;
                ip.octets().to_vec()
            }
            other => {
                return Err(DomainError::InvalidConfig(format!(
                    "unknown option type '{other}' in '{line}'"
                )))
            }
        };

        Ok(Self { code, data })
    }
}

/// IPv4 side of the DHCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dhcp4Config {
    pub gateway_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,

    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u32,

    /// Conflict-probe timeout; 0 disables the ICMP check.
    #[serde(default = "default_icmp_timeout")]
    pub icmp_timeout_ms: u64,

    /// Extra raw options, `CODE TYPE VALUE` per entry.
    #[serde(default)]
    pub options: Vec<String>,
}

impl Dhcp4Config {
    pub fn validate(&self) -> Result<(), DomainError> {
        let mask = u32::from(self.subnet_mask);
        let inverted = !mask;
        if mask == 0 || (inverted & (inverted.wrapping_add(1))) != 0 {
            return Err(DomainError::InvalidConfig(format!(
                "invalid subnet mask {}",
                self.subnet_mask
            )));
        }
        if u32::from(self.range_start) > u32::from(self.range_end) {
            return Err(DomainError::InvalidConfig(format!(
                "range start {} above range end {}",
                self.range_start, self.range_end
            )));
        }
        let net = u32::from(self.gateway_ip) & mask;
        if u32::from(self.range_start) & mask != net || u32::from(self.range_end) & mask != net {
            return Err(DomainError::InvalidConfig(
                "address range lies outside the gateway subnet".into(),
            ));
        }
        for line in &self.options {
            RawDhcpOption::parse(line)?;
        }
        Ok(())
    }

    /// True when `ip` is inside [range_start, range_end].
    pub fn range_contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.range_start)..=u32::from(self.range_end)).contains(&u32::from(ip))
    }

    /// True when `ip` shares the gateway subnet.
    pub fn subnet_contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(ip) & mask == u32::from(self.gateway_ip) & mask
    }

    pub fn parsed_options(&self) -> Result<Vec<RawDhcpOption>, DomainError> {
        self.options.iter().map(|l| RawDhcpOption::parse(l)).collect()
    }
}

/// IPv6 side of the DHCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dhcp6Config {
    pub range_start: Ipv6Addr,

    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u32,
}

impl Dhcp6Config {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.range_start.is_unspecified() {
            return Err(DomainError::InvalidConfig(
                "dhcpv6 range_start must be set".into(),
            ));
        }
        Ok(())
    }

    /// Allocation space: 128-bit increments from `range_start`, /120 by
    /// convention.
    pub fn range_contains(&self, ip: Ipv6Addr) -> bool {
        let start = u128::from(self.range_start);
        let ip = u128::from(ip);
        ip >= start && ip <= (start | 0xff)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DhcpConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub interface_name: String,

    #[serde(default)]
    pub conf4: Option<Dhcp4Config>,

    #[serde(default)]
    pub conf6: Option<Dhcp6Config>,

    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Lease database; relative paths resolve under `work_dir`.
    #[serde(default = "default_db_path")]
    pub db_file_path: PathBuf,
}

impl DhcpConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.enabled {
            return Ok(());
        }
        if self.interface_name.is_empty() {
            return Err(DomainError::InvalidConfig(
                "dhcp.interface_name must be set when dhcp is enabled".into(),
            ));
        }
        if self.conf4.is_none() && self.conf6.is_none() {
            return Err(DomainError::InvalidConfig(
                "dhcp is enabled but neither conf4 nor conf6 is present".into(),
            ));
        }
        if let Some(conf4) = &self.conf4 {
            conf4.validate()?;
        }
        if let Some(conf6) = &self.conf6 {
            conf6.validate()?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        if self.db_file_path.is_absolute() {
            self.db_file_path.clone()
        } else {
            self.work_dir.join(&self.db_file_path)
        }
    }
}

fn default_lease_duration() -> u32 {
    86400
}

fn default_icmp_timeout() -> u64 {
    1000
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("leases.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf4() -> Dhcp4Config {
        Dhcp4Config {
            gateway_ip: "192.168.10.1".parse().unwrap(),
            subnet_mask: "255.255.255.0".parse().unwrap(),
            range_start: "192.168.10.100".parse().unwrap(),
            range_end: "192.168.10.200".parse().unwrap(),
            lease_duration_secs: 86400,
            icmp_timeout_ms: 0,
            options: vec![],
        }
    }

    #[test]
    fn valid_conf4() {
        assert!(conf4().validate().is_ok());
    }

    #[test]
    fn rejects_noncontiguous_mask() {
        let mut c = conf4();
        c.subnet_mask = "255.0.255.0".parse().unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_misordered_range() {
        let mut c = conf4();
        c.range_start = "192.168.10.200".parse().unwrap();
        c.range_end = "192.168.10.100".parse().unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_range_outside_subnet() {
        let mut c = conf4();
        c.range_end = "192.168.11.50".parse().unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn raw_option_hex_and_ip() {
        let opt = RawDhcpOption::parse("43 hex 0102ff").unwrap();
        assert_eq!(opt.code, 43);
        assert_eq!(opt.data, vec![0x01, 0x02, 0xff]);

        let opt = RawDhcpOption::parse("252 ip 192.168.1.1").unwrap();
        assert_eq!(opt.data, vec![192, 168, 1, 1]);

        assert!(RawDhcpOption::parse("260 ip 1.2.3.4").is_err());
        assert!(RawDhcpOption::parse("43 hex 0x01").is_err());
        assert!(RawDhcpOption::parse("43 str hello").is_err());
    }

    #[test]
    fn v6_range_window() {
        let c = Dhcp6Config {
            range_start: "2001::2".parse().unwrap(),
            lease_duration_secs: 3600,
        };
        assert!(c.range_contains("2001::2".parse().unwrap()));
        assert!(c.range_contains("2001::ff".parse().unwrap()));
        assert!(!c.range_contains("2001::1:0".parse().unwrap()));
    }
}
