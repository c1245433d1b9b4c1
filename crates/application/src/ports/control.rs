use async_trait::async_trait;
use homegate_domain::{AccessList, DhcpConfig, DnsConfig, DomainError, Lease, LeaseMask, MacAddr};
use std::net::IpAddr;

/// Outcome of one probe question in `find_active_dhcp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtherServerAnswer {
    Yes,
    No,
    Error(String),
}

/// What `find_active_dhcp` reports to the adapter, per family.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub v4_other_server: OtherServerAnswer,
    pub v4_static_ip: OtherServerAnswer,
    pub v6_other_server: OtherServerAnswer,
}

/// Control surface of the DHCP core, consumed by the HTTP adapter.
#[async_trait]
pub trait DhcpControl: Send + Sync {
    async fn leases(&self, mask: LeaseMask) -> Vec<Lease>;

    async fn find_mac_by_ip(&self, ip: IpAddr) -> Option<MacAddr>;

    async fn add_static_lease(&self, lease: Lease) -> Result<(), DomainError>;

    async fn remove_static_lease(&self, lease: Lease) -> Result<(), DomainError>;

    /// Validate and atomically swap the configuration; listeners restart
    /// only when the bound interface changed.
    async fn set_config(&self, config: DhcpConfig) -> Result<(), DomainError>;

    async fn find_active_dhcp(&self, iface: &str) -> ProbeReport;

    /// Stop the server and remove the lease database. The work directory and
    /// database path survive into the next configuration.
    async fn reset(&self) -> Result<(), DomainError>;
}

/// Control surface of the DNS core.
#[async_trait]
pub trait DnsControl: Send + Sync {
    async fn access_list(&self) -> AccessList;

    /// Idempotent: equal arguments compile to identical engine state.
    async fn set_access_list(&self, access: AccessList) -> Result<(), DomainError>;

    async fn set_config(&self, config: DnsConfig) -> Result<(), DomainError>;
}
