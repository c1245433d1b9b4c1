//! Homegate Domain Layer
pub mod access;
pub mod config;
pub mod errors;
pub mod filtering;
pub mod lease;
pub mod upstream;

pub use access::{AccessList, ClientMatcher};
pub use config::{Config, Dhcp4Config, Dhcp6Config, DhcpConfig, DnsConfig, RawDhcpOption};
pub use errors::DomainError;
pub use filtering::{BlockingMode, FilterReason, FilterResult};
pub use lease::{Lease, LeaseMask, MacAddr, STATIC_LEASE_EXPIRY};
pub use upstream::{UpstreamPolicy, UpstreamSpec, UpstreamTransport};
