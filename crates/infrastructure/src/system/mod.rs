pub mod ifaces;
pub mod static_ip;
