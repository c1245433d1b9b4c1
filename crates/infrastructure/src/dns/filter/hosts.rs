use compact_str::CompactString;
use rustc_hash::FxBuildHasher;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

/// Compiled hosts entries: `ip host [host…]` lines from the configuration.
///
/// Forward lookups return every address mapped to the name; reverse lookups
/// return the first name a given address was listed under.
#[derive(Default)]
pub struct HostsIndex {
    by_name: HashMap<CompactString, Vec<IpAddr>, FxBuildHasher>,
    by_ip: HashMap<IpAddr, Arc<str>, FxBuildHasher>,
}

impl HostsIndex {
    pub fn compile(lines: &[String]) -> Self {
        let mut index = HostsIndex::default();
        for line in lines {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(ip) = fields.next().and_then(|f| f.parse::<IpAddr>().ok()) else {
                warn!(line, "Ignoring hosts entry without a leading IP");
                continue;
            };
            let mut any = false;
            for host in fields {
                any = true;
                let host = host.trim_end_matches('.').to_lowercase();
                index
                    .by_name
                    .entry(CompactString::new(&host))
                    .or_default()
                    .push(ip);
                index.by_ip.entry(ip).or_insert_with(|| Arc::from(host));
            }
            if !any {
                warn!(line, "Ignoring hosts entry without a hostname");
            }
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Addresses for `host` (lower-cased, no trailing dot).
    pub fn lookup(&self, host: &str) -> Option<&[IpAddr]> {
        self.by_name.get(host).map(|v| v.as_slice())
    }

    /// Reverse entry for a PTR question about `ip`.
    pub fn lookup_reverse(&self, ip: IpAddr) -> Option<Arc<str>> {
        self.by_ip.get(&ip).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn forward_and_reverse() {
        let index = HostsIndex::compile(&lines(&[
            "127.0.0.1 host.example.org",
            "192.168.1.10 nas nas.lan",
        ]));
        assert_eq!(
            index.lookup("host.example.org").unwrap(),
            &["127.0.0.1".parse::<IpAddr>().unwrap()][..]
        );
        assert_eq!(
            index.lookup_reverse("192.168.1.10".parse().unwrap()).unwrap().as_ref(),
            "nas"
        );
        assert!(index.lookup("unknown.example.org").is_none());
    }

    #[test]
    fn multiple_ips_per_name() {
        let index = HostsIndex::compile(&lines(&[
            "10.0.0.1 dual.lan",
            "fd00::1 dual.lan",
        ]));
        assert_eq!(index.lookup("dual.lan").unwrap().len(), 2);
    }

    #[test]
    fn garbage_lines_ignored() {
        let index = HostsIndex::compile(&lines(&["# comment", "not-an-ip host", "10.0.0.1"]));
        assert!(index.is_empty());
    }
}
