//! Shared fixtures for the DHCP tests.

use crate::dhcp::icmp::ConflictProber;
use dhcproto::v4::{DhcpOption, Flags, HType, Message, MessageType, Opcode};
use homegate_application::{LeaseChange, LeaseChangeListener};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

pub struct NeverInUse;

impl ConflictProber for NeverInUse {
    fn in_use(&self, _ip: Ipv4Addr, _timeout: Duration) -> bool {
        false
    }
}

pub struct InUseFor(pub Vec<Ipv4Addr>);

impl ConflictProber for InUseFor {
    fn in_use(&self, ip: Ipv4Addr, _timeout: Duration) -> bool {
        self.0.contains(&ip)
    }
}

struct NoopListener;

impl LeaseChangeListener for NoopListener {
    fn lease_changed(&self, _change: LeaseChange) {}
}

pub fn noop_listener() -> Arc<dyn LeaseChangeListener> {
    Arc::new(NoopListener)
}

pub fn discover(mac: [u8; 6]) -> Message {
    let mut message = Message::default();
    message
        .set_opcode(Opcode::BootRequest)
        .set_htype(HType::Eth)
        .set_xid(fastrand::u32(..))
        .set_flags(Flags::default().set_broadcast())
        .set_chaddr(&mac);
    message
        .opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Discover));
    message
}

pub fn request_for(mac: [u8; 6], ip: Ipv4Addr, server_id: Option<Ipv4Addr>) -> Message {
    let mut message = Message::default();
    message
        .set_opcode(Opcode::BootRequest)
        .set_htype(HType::Eth)
        .set_xid(fastrand::u32(..))
        .set_flags(Flags::default().set_broadcast())
        .set_chaddr(&mac);
    let opts = message.opts_mut();
    opts.insert(DhcpOption::MessageType(MessageType::Request));
    opts.insert(DhcpOption::RequestedIpAddress(ip));
    if let Some(server) = server_id {
        opts.insert(DhcpOption::ServerIdentifier(server));
    }
    message
}
