use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// The policy by which a filtered query is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMode {
    /// Unset in the configuration. Behaves as `NullIp` for A/AAAA and as an
    /// empty NOERROR answer for every other type.
    #[default]
    Default,
    NxDomain,
    Refused,
    NullIp,
    CustomIp,
}

/// Why a request (or response) was filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    FilteredByList,
    SafeBrowsing,
    ParentalControl,
    SafeSearch,
    Rewritten,
    HostsFile,
    AllowedByList,
}

/// Outcome of running a hostname (or an answered IP) through the filters.
#[derive(Debug, Clone)]
pub enum FilterResult {
    NotFiltered,
    /// Matched a blocklist rule; answered per `BlockingMode`.
    Blocked {
        rule: Arc<str>,
        list_id: i64,
    },
    /// Matched an exception (`@@`) rule; filtering stops, query proceeds.
    Allowed {
        rule: Arc<str>,
        list_id: i64,
    },
    /// Safe-browsing category hit; answered with CNAME + A to the block host.
    SafeBrowsing,
    /// Parental-control category hit; answered like safe-browsing.
    Parental,
    /// The question is rewritten to the canonical name and resolution
    /// continues under that name.
    RewriteCname {
        canonical: Arc<str>,
        reason: FilterReason,
    },
    /// Answered directly with the listed addresses.
    RewriteIps(Vec<IpAddr>),
    /// Answered from a hosts-file entry.
    HostsIps(Vec<IpAddr>),
    /// Reverse hosts-file answer for a PTR question.
    HostsPtr(Arc<str>),
}

impl FilterResult {
    pub fn is_filtered(&self) -> bool {
        !matches!(
            self,
            FilterResult::NotFiltered | FilterResult::Allowed { .. }
        )
    }

    pub fn reason(&self) -> Option<FilterReason> {
        match self {
            FilterResult::NotFiltered => None,
            FilterResult::Blocked { .. } => Some(FilterReason::FilteredByList),
            FilterResult::Allowed { .. } => Some(FilterReason::AllowedByList),
            FilterResult::SafeBrowsing => Some(FilterReason::SafeBrowsing),
            FilterResult::Parental => Some(FilterReason::ParentalControl),
            FilterResult::RewriteCname { reason, .. } => Some(*reason),
            FilterResult::RewriteIps(_) => Some(FilterReason::Rewritten),
            FilterResult::HostsIps(_) | FilterResult::HostsPtr(_) => Some(FilterReason::HostsFile),
        }
    }
}
