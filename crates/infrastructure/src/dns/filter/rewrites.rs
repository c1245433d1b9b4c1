use compact_str::CompactString;
use homegate_domain::config::dns::RewriteRule;
use rustc_hash::FxBuildHasher;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

/// What a rewrite rule answers with.
#[derive(Debug, Clone)]
pub enum RewriteTarget {
    Cname(Arc<str>),
    Ips(Vec<IpAddr>),
}

/// Local DNS rewrites: exact domains or `*.` wildcards mapped to either a
/// canonical name or a fixed set of addresses.
#[derive(Default)]
pub struct RewriteTable {
    exact: HashMap<CompactString, RewriteTarget, FxBuildHasher>,
    wildcard: HashMap<CompactString, RewriteTarget, FxBuildHasher>,
}

impl RewriteTable {
    pub fn compile(rules: &[RewriteRule]) -> Self {
        let mut table = RewriteTable::default();
        for rule in rules {
            let answer = rule.answer.trim();
            let target = match answer.parse::<IpAddr>() {
                Ok(ip) => RewriteTarget::Ips(vec![ip]),
                Err(_) => RewriteTarget::Cname(Arc::from(
                    answer.trim_end_matches('.').to_lowercase(),
                )),
            };
            let domain = rule.domain.trim_end_matches('.').to_lowercase();
            let (map, key) = match domain.strip_prefix("*.") {
                Some(suffix) => (&mut table.wildcard, CompactString::new(suffix)),
                None => (&mut table.exact, CompactString::new(&domain)),
            };
            // Merge IP targets for the same domain into one answer; a later
            // CNAME cannot override an earlier rule.
            match map.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(target);
                }
                Entry::Occupied(mut slot) => {
                    if let (RewriteTarget::Ips(existing), RewriteTarget::Ips(new)) =
                        (slot.get_mut(), &target)
                    {
                        existing.extend(new.iter().copied());
                    }
                }
            }
        }
        table
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }

    /// Find a rewrite for `host`: exact first, then the longest wildcard
    /// suffix.
    pub fn find(&self, host: &str) -> Option<&RewriteTarget> {
        if let Some(target) = self.exact.get(host) {
            return Some(target);
        }
        let mut rest = host;
        while let Some((_, suffix)) = rest.split_once('.') {
            if let Some(target) = self.wildcard.get(suffix) {
                return Some(target);
            }
            rest = suffix;
        }
        None
    }
}

/// A set of service domains matched with their subdomains; backs the
/// safe-browsing and parental categories.
#[derive(Default)]
pub struct DomainSet {
    domains: HashSet<CompactString, FxBuildHasher>,
}

impl DomainSet {
    pub fn compile(domains: &[String]) -> Self {
        Self {
            domains: domains
                .iter()
                .map(|d| CompactString::new(d.trim_end_matches('.').to_lowercase()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// True when `host` or any ancestor domain is in the set.
    pub fn contains(&self, host: &str) -> bool {
        let mut rest = host;
        loop {
            if self.domains.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, suffix)) => rest = suffix,
                None => return false,
            }
        }
    }
}

/// Safe-search CNAME targets for the major engines, applied when
/// `safe_search_enabled` is on.
pub fn safe_search_target(host: &str) -> Option<&'static str> {
    const MAP: &[(&str, &str)] = &[
        ("google.com", "forcesafesearch.google.com"),
        ("www.google.com", "forcesafesearch.google.com"),
        ("bing.com", "strict.bing.com"),
        ("www.bing.com", "strict.bing.com"),
        ("duckduckgo.com", "safe.duckduckgo.com"),
        ("www.duckduckgo.com", "safe.duckduckgo.com"),
        ("www.youtube.com", "restrictmoderate.youtube.com"),
        ("youtube.com", "restrictmoderate.youtube.com"),
        ("m.youtube.com", "restrictmoderate.youtube.com"),
    ];
    MAP.iter().find(|(d, _)| *d == host).map(|(_, t)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(domain: &str, answer: &str) -> RewriteRule {
        RewriteRule {
            domain: domain.into(),
            answer: answer.into(),
        }
    }

    #[test]
    fn exact_ip_rewrite() {
        let table = RewriteTable::compile(&[rule("printer.lan", "192.168.1.9")]);
        match table.find("printer.lan").unwrap() {
            RewriteTarget::Ips(ips) => assert_eq!(ips.len(), 1),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn wildcard_cname_rewrite() {
        let table = RewriteTable::compile(&[rule("*.apps.lan", "gateway.lan")]);
        match table.find("grafana.apps.lan").unwrap() {
            RewriteTarget::Cname(name) => assert_eq!(name.as_ref(), "gateway.lan"),
            other => panic!("unexpected target {other:?}"),
        }
        assert!(table.find("apps.lan").is_none());
    }

    #[test]
    fn dual_stack_rewrites_merge() {
        let table = RewriteTable::compile(&[
            rule("dual.lan", "10.0.0.1"),
            rule("dual.lan", "fd00::1"),
        ]);
        match table.find("dual.lan").unwrap() {
            RewriteTarget::Ips(ips) => assert_eq!(ips.len(), 2),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn domain_set_walks_ancestors() {
        let set = DomainSet::compile(&["casino.example".into()]);
        assert!(set.contains("casino.example"));
        assert!(set.contains("play.casino.example"));
        assert!(!set.contains("example"));
    }

    #[test]
    fn safe_search_known_engines() {
        assert_eq!(
            safe_search_target("www.google.com"),
            Some("forcesafesearch.google.com")
        );
        assert_eq!(safe_search_target("example.com"), None);
    }
}
