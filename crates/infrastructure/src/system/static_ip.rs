use homegate_application::StaticIpCheck;
use homegate_domain::DomainError;
use std::path::{Path, PathBuf};

/// Detects a static address configured through dhcpcd, the common setup on
/// the small Linux boxes this server runs on.
pub struct DhcpcdStaticIpCheck {
    conf_path: PathBuf,
}

impl DhcpcdStaticIpCheck {
    pub fn new() -> Self {
        Self {
            conf_path: PathBuf::from("/etc/dhcpcd.conf"),
        }
    }

    pub fn with_path(conf_path: impl AsRef<Path>) -> Self {
        Self {
            conf_path: conf_path.as_ref().to_path_buf(),
        }
    }

    fn scan(text: &str, iface: &str) -> bool {
        let mut in_iface_block = false;
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("interface") {
                in_iface_block = rest.trim() == iface;
                continue;
            }
            if in_iface_block && line.starts_with("static ip_address") {
                return true;
            }
        }
        false
    }
}

impl Default for DhcpcdStaticIpCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticIpCheck for DhcpcdStaticIpCheck {
    fn has_static_ip(&self, iface: &str) -> Result<bool, DomainError> {
        match std::fs::read_to_string(&self.conf_path) {
            Ok(text) => Ok(Self::scan(&text, iface)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DomainError::IoError(format!(
                "read {}: {e}",
                self.conf_path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_static_block() {
        let conf = "\nhostname\n\ninterface eth0\nstatic ip_address=192.168.0.2/24\n";
        assert!(DhcpcdStaticIpCheck::scan(conf, "eth0"));
        assert!(!DhcpcdStaticIpCheck::scan(conf, "eth1"));
    }

    #[test]
    fn missing_file_means_no_static() {
        let check = DhcpcdStaticIpCheck::with_path("/nonexistent/dhcpcd.conf");
        assert_eq!(check.has_static_ip("eth0").unwrap(), false);
    }
}
