//! Homegate Infrastructure Layer
//!
//! The two cores live here: the DNS forwarder (`dns`) and the DHCP server
//! (`dhcp`), plus the host-system adapters they share (`system`).
pub mod dhcp;
pub mod dns;
pub mod system;
