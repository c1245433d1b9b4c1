//! Other-DHCP-server discovery: emulate an ordinary client and listen for
//! any authoritative answer.

use crate::system::ifaces::InterfaceInfo;
use dhcproto::v4::{self, HType};
use dhcproto::v6;
use dhcproto::{Decodable, Decoder, Encodable};
use homegate_domain::DomainError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long we listen for a competing server.
const DISCOVER_WAIT: Duration = Duration::from_secs(3);

fn our_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "homegate".to_string())
}

fn build_probe_discover(iface: &InterfaceInfo, xid: u32) -> v4::Message {
    let mac = *iface.mac.as_bytes();
    let mut message = v4::Message::default();
    message
        .set_opcode(v4::Opcode::BootRequest)
        .set_htype(HType::Eth)
        .set_xid(xid)
        .set_flags(v4::Flags::default().set_broadcast())
        .set_chaddr(&mac);

    let opts = message.opts_mut();
    opts.insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
    opts.insert(v4::DhcpOption::ParameterRequestList(vec![
        v4::OptionCode::SubnetMask,
        v4::OptionCode::Router,
        v4::OptionCode::DomainNameServer,
        v4::OptionCode::DomainName,
    ]));
    opts.insert(v4::DhcpOption::MaxMessageSize(1500));
    let mut client_id = Vec::with_capacity(7);
    client_id.push(1); // hardware type Ethernet
    client_id.extend_from_slice(&mac);
    opts.insert(v4::DhcpOption::ClientIdentifier(client_id));
    opts.insert(v4::DhcpOption::Hostname(our_hostname()));
    message
}

/// A reply counts only when it is a BOOTREPLY to our exact probe.
fn is_answer_to_probe(reply: &v4::Message, iface: &InterfaceInfo, xid: u32) -> bool {
    reply.opcode() == v4::Opcode::BootReply
        && matches!(reply.htype(), HType::Eth)
        && reply.xid() == xid
        && reply.chaddr().len() >= 6
        && reply.chaddr()[..6] == iface.mac.as_bytes()[..]
        && reply.opts().msg_type().is_some()
}

/// Broadcast a client-style Discover on the interface and report whether
/// any DHCPv4 server answered within the window.
pub async fn other_server_present_v4(iface: &InterfaceInfo) -> Result<bool, DomainError> {
    let iface = iface.clone();
    tokio::task::spawn_blocking(move || probe_v4_blocking(&iface))
        .await
        .map_err(|e| DomainError::IoError(format!("probe task: {e}")))?
}

fn probe_v4_blocking(iface: &InterfaceInfo) -> Result<bool, DomainError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DomainError::IoError(format!("create probe socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| DomainError::IoError(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| DomainError::IoError(e.to_string()))?;
    #[cfg(target_os = "linux")]
    socket
        .bind_device(Some(iface.name.as_bytes()))
        .map_err(|e| DomainError::IoError(format!("bind to device {}: {e}", iface.name)))?;
    socket
        .bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68)).into())
        .map_err(|e| DomainError::IoError(format!("bind probe :68: {e}")))?;

    let xid = fastrand::u32(..);
    let probe = build_probe_discover(iface, xid)
        .to_vec()
        .map_err(|e| DomainError::IoError(format!("encode probe: {e}")))?;
    let broadcast = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 67));
    socket
        .send_to(&probe, &broadcast.into())
        .map_err(|e| DomainError::IoError(format!("send probe: {e}")))?;

    let deadline = Instant::now() + DISCOVER_WAIT;
    let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| DomainError::IoError(e.to_string()))?;
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(false)
            }
            Err(e) => return Err(DomainError::IoError(format!("probe receive: {e}"))),
        };
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        match v4::Message::decode(&mut Decoder::new(data)) {
            Ok(reply) if is_answer_to_probe(&reply, iface, xid) => {
                debug!(iface = %iface.name, "Another DHCPv4 server answered the probe");
                return Ok(true);
            }
            _ => continue,
        }
    }
}

/// Multicast a Solicit and report whether any DHCPv6 server advertises.
pub async fn other_server_present_v6(iface: &InterfaceInfo) -> Result<bool, DomainError> {
    let socket = tokio::net::UdpSocket::bind(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        546,
    ))
    .await
    .map_err(|e| DomainError::IoError(format!("bind probe :546: {e}")))?;

    let mut solicit = v6::Message::new(v6::MessageType::Solicit);
    let xid = solicit.xid();
    let mut duid = Vec::with_capacity(10);
    duid.extend_from_slice(&3u16.to_be_bytes());
    duid.extend_from_slice(&1u16.to_be_bytes());
    duid.extend_from_slice(iface.mac.as_bytes());
    solicit.opts_mut().insert(v6::DhcpOption::ClientId(duid));
    solicit.opts_mut().insert(v6::DhcpOption::IANA(v6::IANA {
        id: fastrand::u32(..),
        t1: 0,
        t2: 0,
        opts: v6::DhcpOptions::new(),
    }));
    let bytes = solicit
        .to_vec()
        .map_err(|e| DomainError::IoError(format!("encode solicit: {e}")))?;

    let target = SocketAddr::new(
        IpAddr::V6("ff02::1:2".parse().unwrap()),
        547,
    );
    socket
        .send_to(&bytes, target)
        .await
        .map_err(|e| DomainError::IoError(format!("send solicit: {e}")))?;

    let mut buf = vec![0u8; 1500];
    let deadline = tokio::time::Instant::now() + DISCOVER_WAIT;
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        let Ok(Ok((len, _))) = received else {
            return Ok(false);
        };
        if let Ok(reply) = v6::Message::decode(&mut Decoder::new(&buf[..len])) {
            if reply.msg_type() == v6::MessageType::Advertise && reply.xid() == xid {
                debug!(iface = %iface.name, "Another DHCPv6 server answered the probe");
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homegate_domain::MacAddr;

    fn iface() -> InterfaceInfo {
        InterfaceInfo {
            name: "eth0".into(),
            index: 2,
            mac: MacAddr([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            ipv4: vec!["192.168.10.1".parse().unwrap()],
            ipv6: vec![],
        }
    }

    #[test]
    fn probe_discover_shape() {
        let iface = iface();
        let probe = build_probe_discover(&iface, 0x1234_5678);
        assert_eq!(probe.opcode(), v4::Opcode::BootRequest);
        assert_eq!(probe.xid(), 0x1234_5678);
        assert_eq!(
            probe.opts().msg_type(),
            Some(v4::MessageType::Discover)
        );
        assert!(probe.opts().get(v4::OptionCode::MaxMessageSize).is_some());
        assert!(probe
            .opts()
            .get(v4::OptionCode::ClientIdentifier)
            .is_some());
    }

    #[test]
    fn reply_matching_is_strict() {
        let iface = iface();
        let probe = build_probe_discover(&iface, 42);

        let mut reply = probe.clone();
        reply.set_opcode(v4::Opcode::BootReply);
        assert!(is_answer_to_probe(&reply, &iface, 42));

        // Wrong xid is not ours.
        assert!(!is_answer_to_probe(&reply, &iface, 43));

        // A request opcode is not an answer.
        assert!(!is_answer_to_probe(&probe, &iface, 42));

        // Foreign hardware address is not ours.
        let mut foreign = reply.clone();
        foreign.set_chaddr(&[9u8; 6]);
        assert!(!is_answer_to_probe(&foreign, &iface, 42));
    }
}
