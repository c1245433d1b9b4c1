//! ipset side-effects: answered addresses for bound domains are pushed into
//! kernel sets over a netlink channel.

#[cfg(target_os = "linux")]
pub mod netlink;

use compact_str::CompactString;
use dashmap::DashMap;
use homegate_domain::DomainError;
use rustc_hash::FxBuildHasher;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Kernel-side TTL slop added on top of the DNS answer TTL, so entries
/// outlive the cached answer slightly.
const TIMEOUT_SLOP_SECS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFamily {
    Inet,
    Inet6,
}

#[derive(Debug, Clone, Copy)]
pub struct SetProperties {
    pub family: SetFamily,
    pub timeout: bool,
    pub comment: bool,
}

/// The kernel channel; implemented over netlink on Linux and mocked in
/// tests.
pub trait IpsetChannel: Send + Sync {
    fn probe_header(&self, name: &str) -> Result<SetProperties, DomainError>;
    fn add(&self, name: &str, ip: IpAddr, timeout: Option<u32>) -> Result<(), DomainError>;
}

struct BoundSet {
    name: Arc<str>,
    props: SetProperties,
}

/// Compiled domain → set bindings plus the per-IP deduplication caches.
pub struct IpsetEngine {
    bindings: HashMap<CompactString, Vec<Arc<BoundSet>>, FxBuildHasher>,
    v4_seen: DashMap<[u8; 4], HashSet<Arc<str>>, FxBuildHasher>,
    v6_seen: DashMap<[u8; 16], HashSet<Arc<str>>, FxBuildHasher>,
    channel: Arc<dyn IpsetChannel>,
}

impl IpsetEngine {
    /// Parse `DOMAIN[,DOMAIN…]/IPSET[,IPSET…]` lines and probe each distinct
    /// set once. Sets the kernel does not report (missing, or family
    /// unspecified) are dropped from their bindings with a warning.
    pub fn new(lines: &[String], channel: Arc<dyn IpsetChannel>) -> Result<Self, DomainError> {
        let mut probed: HashMap<String, Option<Arc<BoundSet>>> = HashMap::new();
        let mut bindings: HashMap<CompactString, Vec<Arc<BoundSet>>, FxBuildHasher> =
            HashMap::with_hasher(FxBuildHasher);

        for line in lines {
            let (domains, sets) = line.split_once('/').ok_or_else(|| {
                DomainError::InvalidConfig(format!("bad ipset binding '{line}'"))
            })?;

            let mut resolved = Vec::new();
            for set_name in sets.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let entry = probed.entry(set_name.to_string()).or_insert_with(|| {
                    match channel.probe_header(set_name) {
                        Ok(props) => Some(Arc::new(BoundSet {
                            name: Arc::from(set_name),
                            props,
                        })),
                        Err(e) => {
                            warn!(set = set_name, error = %e, "Dropping unknown ipset from bindings");
                            None
                        }
                    }
                });
                if let Some(set) = entry {
                    resolved.push(Arc::clone(set));
                }
            }
            if resolved.is_empty() {
                continue;
            }

            for domain in domains.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                let domain = domain.trim_end_matches('.').to_lowercase();
                bindings
                    .entry(CompactString::new(&domain))
                    .or_default()
                    .extend(resolved.iter().cloned());
            }
        }

        Ok(Self {
            bindings,
            v4_seen: DashMap::with_hasher(FxBuildHasher),
            v6_seen: DashMap::with_hasher(FxBuildHasher),
            channel,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Find the binding for `host`: the host itself first, then ancestor
    /// domains, most specific wins.
    fn find(&self, host: &str) -> Option<&[Arc<BoundSet>]> {
        let mut rest = host;
        loop {
            if let Some(sets) = self.bindings.get(rest) {
                return Some(sets.as_slice());
            }
            match rest.split_once('.') {
                Some((_, suffix)) => rest = suffix,
                None => return None,
            }
        }
    }

    fn family_matches(props: &SetProperties, ip: IpAddr) -> bool {
        matches!(
            (props.family, ip),
            (SetFamily::Inet, IpAddr::V4(_)) | (SetFamily::Inet6, IpAddr::V6(_))
        )
    }

    /// True when this (ip, set) pair was already pushed. Timeout-capable
    /// sets are never deduplicated so the kernel TTL is refreshed.
    fn already_seen(&self, set: &BoundSet, ip: IpAddr) -> bool {
        if set.props.timeout {
            return false;
        }
        match ip {
            IpAddr::V4(v4) => {
                let mut entry = self.v4_seen.entry(v4.octets()).or_default();
                !entry.insert(Arc::clone(&set.name))
            }
            IpAddr::V6(v6) => {
                let mut entry = self.v6_seen.entry(v6.octets()).or_default();
                !entry.insert(Arc::clone(&set.name))
            }
        }
    }

    /// Push every answered address of `host` into its bound sets. Failures
    /// are logged and never surface to the client.
    pub fn process(&self, host: &str, answers: &[(IpAddr, u32)]) {
        let Some(sets) = self.find(host) else {
            return;
        };
        for set in sets {
            for &(ip, ttl) in answers {
                if !Self::family_matches(&set.props, ip) {
                    continue;
                }
                if self.already_seen(set, ip) {
                    continue;
                }
                let timeout = set
                    .props
                    .timeout
                    .then_some(ttl.saturating_add(TIMEOUT_SLOP_SECS));
                if let Err(e) = self.channel.add(&set.name, ip, timeout) {
                    debug!(set = %set.name, %ip, error = %e, "ipset add failed");
                }
            }
        }
    }

    /// Forget the dedup history; used on configuration reload.
    pub fn clear_seen(&self) {
        self.v4_seen.clear();
        self.v6_seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockChannel {
        known: HashMap<String, SetProperties>,
        adds: Mutex<Vec<(String, IpAddr, Option<u32>)>>,
    }

    impl MockChannel {
        fn new(known: &[(&str, SetProperties)]) -> Arc<Self> {
            Arc::new(Self {
                known: known
                    .iter()
                    .map(|(n, p)| (n.to_string(), *p))
                    .collect(),
                adds: Mutex::new(Vec::new()),
            })
        }

        fn adds(&self) -> Vec<(String, IpAddr, Option<u32>)> {
            self.adds.lock().unwrap().clone()
        }
    }

    impl IpsetChannel for MockChannel {
        fn probe_header(&self, name: &str) -> Result<SetProperties, DomainError> {
            self.known
                .get(name)
                .copied()
                .ok_or_else(|| DomainError::IoError(format!("no such set: {name}")))
        }

        fn add(&self, name: &str, ip: IpAddr, timeout: Option<u32>) -> Result<(), DomainError> {
            self.adds
                .lock()
                .unwrap()
                .push((name.to_string(), ip, timeout));
            Ok(())
        }
    }

    const INET: SetProperties = SetProperties {
        family: SetFamily::Inet,
        timeout: false,
        comment: false,
    };

    const INET_TIMEOUT: SetProperties = SetProperties {
        family: SetFamily::Inet,
        timeout: true,
        comment: false,
    };

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn subdomain_walk_matches_most_specific() {
        let channel = MockChannel::new(&[("generic", INET), ("specific", INET)]);
        let engine = IpsetEngine::new(
            &[
                "example.com/generic".to_string(),
                "cdn.example.com/specific".to_string(),
            ],
            channel.clone(),
        )
        .unwrap();

        engine.process("a.cdn.example.com", &[(v4("1.2.3.4"), 60)]);
        let adds = channel.adds();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].0, "specific");
    }

    #[test]
    fn dedup_suppresses_repeat_adds() {
        let channel = MockChannel::new(&[("ads", INET)]);
        let engine =
            IpsetEngine::new(&["example.com/ads".to_string()], channel.clone()).unwrap();
        engine.process("example.com", &[(v4("1.2.3.4"), 60)]);
        engine.process("example.com", &[(v4("1.2.3.4"), 60)]);
        assert_eq!(channel.adds().len(), 1);
    }

    #[test]
    fn timeout_sets_refresh_every_time() {
        let channel = MockChannel::new(&[("vol", INET_TIMEOUT)]);
        let engine =
            IpsetEngine::new(&["example.com/vol".to_string()], channel.clone()).unwrap();
        engine.process("example.com", &[(v4("1.2.3.4"), 60)]);
        engine.process("example.com", &[(v4("1.2.3.4"), 60)]);
        let adds = channel.adds();
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0].2, Some(60 + TIMEOUT_SLOP_SECS));
    }

    #[test]
    fn unknown_set_dropped() {
        let channel = MockChannel::new(&[("real", INET)]);
        let engine = IpsetEngine::new(
            &["example.com/real,ghost".to_string()],
            channel.clone(),
        )
        .unwrap();
        engine.process("example.com", &[(v4("1.2.3.4"), 60)]);
        let adds = channel.adds();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].0, "real");
    }

    #[test]
    fn family_mismatch_skipped() {
        let channel = MockChannel::new(&[("ads", INET)]);
        let engine =
            IpsetEngine::new(&["example.com/ads".to_string()], channel.clone()).unwrap();
        engine.process("example.com", &[("fd00::1".parse().unwrap(), 60)]);
        assert!(channel.adds().is_empty());
    }

    #[test]
    fn malformed_binding_rejected() {
        let channel = MockChannel::new(&[]);
        assert!(IpsetEngine::new(&["no-slash".to_string()], channel).is_err());
    }
}
