//! Homegate Application Layer
//!
//! Port traits that decouple the DNS and DHCP cores from their
//! collaborators: the lease-change fan-out, the host OS capabilities the
//! DHCP core invokes, and the registrar the HTTP adapter plugs into.
pub mod ports;

pub use ports::control::{DhcpControl, DnsControl, OtherServerAnswer, ProbeReport};
pub use ports::lease_events::{LeaseChange, LeaseChangeKind, LeaseChangeListener};
pub use ports::system::{ClientNameSource, StaticIpCheck};
