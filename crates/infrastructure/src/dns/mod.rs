//! The DNS forwarder core.
pub mod access;
pub mod blocked;
pub mod cache;
pub mod filter;
pub mod ipset;
pub mod message;
pub mod pipeline;
pub mod ratelimit;
pub mod server;
pub mod upstream;

pub use server::DnsServer;
