use crate::dns::filter::rules::RuleIndex;
use homegate_domain::{AccessList, ClientMatcher, DomainError};
use std::net::IpAddr;
use std::sync::RwLock;
use tracing::debug;

struct AccessState {
    raw: AccessList,
    allowed: ClientMatcher,
    disallowed: ClientMatcher,
    blocked_hosts: RuleIndex,
}

/// The access gate: client allow/deny lists plus hostname patterns refused
/// outright. Readers never block readers; `set` takes the write lock only
/// for the final swap.
pub struct AccessEngine {
    state: RwLock<AccessState>,
}

impl AccessEngine {
    pub fn new(access: AccessList) -> Result<Self, DomainError> {
        Ok(Self {
            state: RwLock::new(Self::compile(access)?),
        })
    }

    fn compile(access: AccessList) -> Result<AccessState, DomainError> {
        let allowed = ClientMatcher::compile(&access.allowed_clients)?;
        let disallowed = ClientMatcher::compile(&access.disallowed_clients)?;
        let blocked_hosts = RuleIndex::compile([(0i64, access.blocked_hosts.as_slice())]);
        Ok(AccessState {
            raw: access,
            allowed,
            disallowed,
            blocked_hosts,
        })
    }

    /// True when the client may talk to us at all. A non-empty allowlist
    /// admits only its members; the denylist applies either way.
    pub fn client_allowed(&self, ip: IpAddr) -> bool {
        let state = self.state.read().unwrap();
        if state.disallowed.contains(ip) {
            return false;
        }
        if !state.allowed.is_empty() && !state.allowed.contains(ip) {
            return false;
        }
        true
    }

    /// True when the question's name is refused outright. `host` must be
    /// lower-cased with the trailing dot removed.
    pub fn host_blocked(&self, host: &str) -> bool {
        let state = self.state.read().unwrap();
        state
            .blocked_hosts
            .find(host)
            .map(|hit| !hit.is_exception)
            .unwrap_or(false)
    }

    pub fn get(&self) -> AccessList {
        self.state.read().unwrap().raw.clone()
    }

    /// Replace the access rules. Compilation happens outside the write
    /// lock; equal inputs produce identical engine state.
    pub fn set(&self, access: AccessList) -> Result<(), DomainError> {
        let compiled = Self::compile(access)?;
        let mut state = self.state.write().unwrap();
        *state = compiled;
        debug!(
            allowed = state.raw.allowed_clients.len(),
            disallowed = state.raw.disallowed_clients.len(),
            blocked_hosts = state.raw.blocked_hosts.len(),
            "Access rules replaced"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(allowed: &[&str], disallowed: &[&str], hosts: &[&str]) -> AccessList {
        AccessList {
            allowed_clients: allowed.iter().map(|s| s.to_string()).collect(),
            disallowed_clients: disallowed.iter().map(|s| s.to_string()).collect(),
            blocked_hosts: hosts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn denylist_refuses() {
        let engine = AccessEngine::new(access(&[], &["192.168.1.50", "10.0.0.0/8"], &[])).unwrap();
        assert!(!engine.client_allowed("192.168.1.50".parse().unwrap()));
        assert!(!engine.client_allowed("10.1.2.3".parse().unwrap()));
        assert!(engine.client_allowed("192.168.1.51".parse().unwrap()));
    }

    #[test]
    fn nonempty_allowlist_is_exclusive() {
        let engine = AccessEngine::new(access(&["192.168.1.0/24"], &[], &[])).unwrap();
        assert!(engine.client_allowed("192.168.1.7".parse().unwrap()));
        assert!(!engine.client_allowed("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn blocked_host_patterns() {
        let engine = AccessEngine::new(access(&[], &[], &["||secret.example^"])).unwrap();
        assert!(engine.host_blocked("secret.example"));
        assert!(engine.host_blocked("www.secret.example"));
        assert!(!engine.host_blocked("public.example"));
    }

    #[test]
    fn set_is_idempotent() {
        let list = access(&["10.0.0.0/8"], &["10.9.9.9"], &["||x.example^"]);
        let engine = AccessEngine::new(list.clone()).unwrap();
        engine.set(list.clone()).unwrap();
        engine.set(list.clone()).unwrap();
        assert_eq!(engine.get(), list);
        assert!(engine.host_blocked("x.example"));
        assert!(!engine.client_allowed("10.9.9.9".parse().unwrap()));
    }

    #[test]
    fn bad_entry_rejected_and_state_kept() {
        let engine = AccessEngine::new(access(&[], &["10.0.0.1"], &[])).unwrap();
        let bad = access(&[], &["not-an-ip"], &[]);
        assert!(engine.set(bad).is_err());
        assert!(!engine.client_allowed("10.0.0.1".parse().unwrap()));
    }
}
