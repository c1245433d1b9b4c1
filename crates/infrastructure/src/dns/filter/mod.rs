//! Request and response filtering.
//!
//! One engine instance serves the whole pipeline. All matching state is
//! compiled into an immutable [`FilterIndexes`] snapshot and swapped
//! atomically on reload, so the per-query path never takes a lock.

pub mod hosts;
pub mod rewrites;
pub mod rules;
pub mod trie;

use arc_swap::ArcSwap;
use homegate_domain::{DnsConfig, FilterReason, FilterResult};
use hosts::HostsIndex;
use rewrites::{DomainSet, RewriteTable, RewriteTarget};
use rules::RuleIndex;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// One compiled snapshot of every filtering input.
pub struct FilterIndexes {
    rules: RuleIndex,
    hosts: HostsIndex,
    rewrites: RewriteTable,
    safe_browsing: DomainSet,
    parental: DomainSet,
    safe_search_enabled: bool,
    safe_browsing_enabled: bool,
    parental_enabled: bool,
}

impl FilterIndexes {
    pub fn compile(config: &DnsConfig, lists: &[(i64, Vec<String>)]) -> Self {
        let rules = RuleIndex::compile(
            lists
                .iter()
                .map(|(id, lines)| (*id, lines.as_slice()))
                .chain(std::iter::once((0i64, config.user_rules.as_slice()))),
        );
        info!(rules = rules.rule_count(), lists = lists.len(), "Filter rules compiled");
        Self {
            rules,
            hosts: HostsIndex::compile(&config.hosts),
            rewrites: RewriteTable::compile(&config.rewrites),
            safe_browsing: DomainSet::compile(&config.safe_browsing_domains),
            parental: DomainSet::compile(&config.parental_domains),
            safe_search_enabled: config.safe_search_enabled,
            safe_browsing_enabled: config.safe_browsing_enabled,
            parental_enabled: config.parental_enabled,
        }
    }
}

/// The request/response filter. Queried once per inbound question and once
/// per answered name/address during response filtering.
pub struct FilterEngine {
    indexes: ArcSwap<FilterIndexes>,
}

impl FilterEngine {
    pub fn new(config: &DnsConfig, lists: &[(i64, Vec<String>)]) -> Self {
        Self {
            indexes: ArcSwap::from_pointee(FilterIndexes::compile(config, lists)),
        }
    }

    /// Swap in a freshly compiled snapshot; in-flight queries keep the old
    /// one until they finish.
    pub fn reload(&self, config: &DnsConfig, lists: &[(i64, Vec<String>)]) {
        self.indexes
            .store(Arc::new(FilterIndexes::compile(config, lists)));
        debug!("Filter indexes swapped");
    }

    /// Filter a forward question. `host` must be lower-cased with the
    /// trailing dot removed.
    pub fn check_host(&self, host: &str) -> FilterResult {
        let idx = self.indexes.load();

        if let Some(ips) = idx.hosts.lookup(host) {
            return FilterResult::HostsIps(ips.to_vec());
        }

        if idx.safe_search_enabled {
            if let Some(target) = rewrites::safe_search_target(host) {
                return FilterResult::RewriteCname {
                    canonical: Arc::from(target),
                    reason: FilterReason::SafeSearch,
                };
            }
        }

        if let Some(target) = idx.rewrites.find(host) {
            return match target {
                RewriteTarget::Cname(name) => FilterResult::RewriteCname {
                    canonical: Arc::clone(name),
                    reason: FilterReason::Rewritten,
                },
                RewriteTarget::Ips(ips) => FilterResult::RewriteIps(ips.clone()),
            };
        }

        if let Some(hit) = idx.rules.find(host) {
            return if hit.is_exception {
                FilterResult::Allowed {
                    rule: hit.text,
                    list_id: hit.list_id,
                }
            } else {
                FilterResult::Blocked {
                    rule: hit.text,
                    list_id: hit.list_id,
                }
            };
        }

        if idx.safe_browsing_enabled && idx.safe_browsing.contains(host) {
            return FilterResult::SafeBrowsing;
        }
        if idx.parental_enabled && idx.parental.contains(host) {
            return FilterResult::Parental;
        }

        FilterResult::NotFiltered
    }

    /// Filter a reverse (PTR) question about `ip`.
    pub fn check_reverse(&self, ip: IpAddr) -> Option<Arc<str>> {
        self.indexes.load().hosts.lookup_reverse(ip)
    }

    /// Re-check an answered IP literal during response filtering.
    pub fn check_ip(&self, ip: IpAddr) -> FilterResult {
        let idx = self.indexes.load();
        if let Some(hit) = idx.rules.find(&ip.to_string()) {
            if !hit.is_exception {
                return FilterResult::Blocked {
                    rule: hit.text,
                    list_id: hit.list_id,
                };
            }
        }
        FilterResult::NotFiltered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homegate_domain::config::dns::RewriteRule;

    fn engine_with(config: DnsConfig, lists: &[(i64, Vec<String>)]) -> FilterEngine {
        FilterEngine::new(&config, lists)
    }

    #[test]
    fn hosts_take_precedence_over_rules() {
        let mut config = DnsConfig::default();
        config.hosts = vec!["127.0.0.1 host.example.org".into()];
        let lists = vec![(1, vec!["||host.example.org^".to_string()])];
        let engine = engine_with(config, &lists);
        assert!(matches!(
            engine.check_host("host.example.org"),
            FilterResult::HostsIps(_)
        ));
    }

    #[test]
    fn exception_outranks_block() {
        let config = DnsConfig::default();
        let lists = vec![(
            1,
            vec!["||blocked.example^".to_string(), "@@||ok.blocked.example^".to_string()],
        )];
        let engine = engine_with(config, &lists);
        assert!(matches!(
            engine.check_host("ads.blocked.example"),
            FilterResult::Blocked { .. }
        ));
        assert!(matches!(
            engine.check_host("ok.blocked.example"),
            FilterResult::Allowed { .. }
        ));
    }

    #[test]
    fn cname_rewrite_continues_resolution() {
        let mut config = DnsConfig::default();
        config.rewrites = vec![RewriteRule {
            domain: "old.lan".into(),
            answer: "new.lan".into(),
        }];
        let engine = engine_with(config, &[]);
        match engine.check_host("old.lan") {
            FilterResult::RewriteCname { canonical, .. } => {
                assert_eq!(canonical.as_ref(), "new.lan")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn safe_browsing_requires_flag() {
        let mut config = DnsConfig::default();
        config.safe_browsing_domains = vec!["evil.example".into()];
        let engine = engine_with(config.clone(), &[]);
        assert!(matches!(
            engine.check_host("evil.example"),
            FilterResult::NotFiltered
        ));

        config.safe_browsing_enabled = true;
        let engine = engine_with(config, &[]);
        assert!(matches!(
            engine.check_host("evil.example"),
            FilterResult::SafeBrowsing
        ));
    }

    #[test]
    fn reload_swaps_rules() {
        let config = DnsConfig::default();
        let engine = engine_with(config.clone(), &[(1, vec!["||gone.example^".to_string()])]);
        assert!(engine.check_host("gone.example").is_filtered());
        engine.reload(&config, &[]);
        assert!(!engine.check_host("gone.example").is_filtered());
    }
}
