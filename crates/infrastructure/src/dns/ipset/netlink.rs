//! Minimal NFNL_SUBSYS_IPSET client.
//!
//! Speaks the kernel ipset protocol directly over two netlink-netfilter
//! sockets (one per address family): header queries at startup to discover
//! each set's properties, ADD requests at runtime.

use super::{IpsetChannel, SetFamily, SetProperties};
use homegate_domain::DomainError;
use netlink_packet_core::{NLM_F_ACK, NLM_F_REQUEST};
use netlink_sys::{protocols::NETLINK_NETFILTER, Socket, SocketAddr};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::trace;

const NFNL_SUBSYS_IPSET: u16 = 6;
const NFNETLINK_V0: u8 = 0;
const IPSET_PROTOCOL: u8 = 6;

const IPSET_CMD_ADD: u16 = 9;
const IPSET_CMD_HEADER: u16 = 12;

// Top-level attributes.
const IPSET_ATTR_PROTOCOL: u16 = 1;
const IPSET_ATTR_SETNAME: u16 = 2;
const IPSET_ATTR_TYPENAME: u16 = 3;
const IPSET_ATTR_FAMILY: u16 = 5;
const IPSET_ATTR_DATA: u16 = 7;

// CADT attributes (inside IPSET_ATTR_DATA).
const IPSET_ATTR_IP: u16 = 1;
const IPSET_ATTR_TIMEOUT: u16 = 6;
const IPSET_ATTR_CADT_FLAGS: u16 = 8;

// Inside IPSET_ATTR_IP.
const IPSET_ATTR_IPADDR_IPV4: u16 = 1;
const IPSET_ATTR_IPADDR_IPV6: u16 = 2;

const IPSET_FLAG_WITH_COMMENT: u32 = 1 << 4;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_F_NET_BYTEORDER: u16 = 0x4000;

const NFPROTO_IPV4: u8 = 2;
const NFPROTO_IPV6: u8 = 10;

const NLMSG_ERROR: u16 = 2;

/// Netlink message writer: 16-byte header, nfgenmsg, 4-byte aligned NLAs.
struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    fn new(cmd: u16, family: u8, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(128);
        let msg_type = (NFNL_SUBSYS_IPSET << 8) | cmd;
        buf.extend_from_slice(&0u32.to_ne_bytes()); // length, patched later
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&(NLM_F_REQUEST | NLM_F_ACK).to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pid
        // struct nfgenmsg
        buf.push(family);
        buf.push(NFNETLINK_V0);
        buf.extend_from_slice(&0u16.to_be_bytes()); // res_id
        Self { buf }
    }

    fn align(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    fn attr(&mut self, kind: u16, payload: &[u8]) {
        self.align();
        let len = (4 + payload.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.align();
    }

    fn attr_u8(&mut self, kind: u16, value: u8) {
        self.attr(kind, &[value]);
    }

    fn attr_u32_be(&mut self, kind: u16, value: u32) {
        self.attr(kind | NLA_F_NET_BYTEORDER, &value.to_be_bytes());
    }

    fn attr_string(&mut self, kind: u16, value: &str) {
        let mut payload = value.as_bytes().to_vec();
        payload.push(0);
        self.attr(kind, &payload);
    }

    /// Open a nested attribute; returns the patch offset for `end_nested`.
    fn begin_nested(&mut self, kind: u16) -> usize {
        self.align();
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf
            .extend_from_slice(&(kind | NLA_F_NESTED).to_ne_bytes());
        offset
    }

    fn end_nested(&mut self, offset: usize) {
        let len = (self.buf.len() - offset) as u16;
        self.buf[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// Iterate the NLAs of `payload`, yielding (type-without-flags, payload).
fn attrs(payload: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset + 4 > payload.len() {
            return None;
        }
        let len = u16::from_ne_bytes([payload[offset], payload[offset + 1]]) as usize;
        let kind = u16::from_ne_bytes([payload[offset + 2], payload[offset + 3]]);
        if len < 4 || offset + len > payload.len() {
            return None;
        }
        let value = &payload[offset + 4..offset + len];
        offset += (len + 3) & !3;
        Some((kind & 0x3fff, value))
    })
}

struct FamilySocket {
    socket: Socket,
    seq: u32,
}

impl FamilySocket {
    fn open() -> Result<Self, DomainError> {
        let mut socket = Socket::new(NETLINK_NETFILTER)
            .map_err(|e| DomainError::IoError(format!("open netlink-netfilter socket: {e}")))?;
        socket
            .bind_auto()
            .map_err(|e| DomainError::IoError(format!("bind netlink socket: {e}")))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| DomainError::IoError(format!("connect netlink socket: {e}")))?;
        Ok(Self {
            socket,
            seq: fastrand::u32(..),
        })
    }

    fn roundtrip(&mut self, request: Vec<u8>) -> Result<Vec<u8>, DomainError> {
        self.socket
            .send(&request, 0)
            .map_err(|e| DomainError::IoError(format!("netlink send: {e}")))?;
        let mut buf = vec![0u8; 8192];
        let read = self
            .socket
            .recv(&mut &mut buf[..], 0)
            .map_err(|e| DomainError::IoError(format!("netlink recv: {e}")))?;
        buf.truncate(read);
        Ok(buf)
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

/// Split a netlink reply into messages, erroring out on NLMSG_ERROR with a
/// nonzero errno.
fn check_reply(reply: &[u8]) -> Result<Option<(u16, &[u8])>, DomainError> {
    let mut offset = 0usize;
    while offset + 16 <= reply.len() {
        let len = u32::from_ne_bytes(reply[offset..offset + 4].try_into().unwrap()) as usize;
        let kind = u16::from_ne_bytes(reply[offset + 4..offset + 6].try_into().unwrap());
        if len < 16 || offset + len > reply.len() {
            break;
        }
        let body = &reply[offset + 16..offset + len];
        if kind == NLMSG_ERROR {
            let errno = i32::from_ne_bytes(body[0..4].try_into().unwrap());
            if errno != 0 {
                let err = std::io::Error::from_raw_os_error(-errno);
                return Err(match err.kind() {
                    ErrorKind::NotFound => {
                        DomainError::IoError(format!("ipset error: {err} (set missing?)"))
                    }
                    _ => DomainError::IoError(format!("ipset error: {err}")),
                });
            }
            return Ok(None);
        }
        // Data message: skip the nfgenmsg, hand back the attribute area.
        if body.len() >= 4 {
            return Ok(Some((kind, &body[4..])));
        }
        offset += (len + 3) & !3;
    }
    Ok(None)
}

/// Two kernel channels, one per family, as the ipset subsystem expects.
pub struct NetlinkIpset {
    v4: Mutex<FamilySocket>,
    v6: Mutex<FamilySocket>,
}

impl NetlinkIpset {
    pub fn open() -> Result<Self, DomainError> {
        Ok(Self {
            v4: Mutex::new(FamilySocket::open()?),
            v6: Mutex::new(FamilySocket::open()?),
        })
    }

    fn socket_for(&self, family: SetFamily) -> &Mutex<FamilySocket> {
        match family {
            SetFamily::Inet => &self.v4,
            SetFamily::Inet6 => &self.v6,
        }
    }
}

impl IpsetChannel for NetlinkIpset {
    fn probe_header(&self, name: &str) -> Result<SetProperties, DomainError> {
        let mut socket = self.v4.lock().unwrap();
        let seq = socket.next_seq();
        let mut writer = MessageWriter::new(IPSET_CMD_HEADER, NFPROTO_IPV4, seq);
        writer.attr_u8(IPSET_ATTR_PROTOCOL, IPSET_PROTOCOL);
        writer.attr_string(IPSET_ATTR_SETNAME, name);
        let reply = socket.roundtrip(writer.finish())?;

        let Some((_, attr_area)) = check_reply(&reply)? else {
            return Err(DomainError::IoError(format!(
                "ipset '{name}': empty header reply"
            )));
        };

        let mut family = None;
        let mut type_name = None;
        let mut timeout = false;
        let mut comment = false;
        for (kind, value) in attrs(attr_area) {
            match kind {
                IPSET_ATTR_FAMILY => {
                    family = value.first().and_then(|f| match *f {
                        NFPROTO_IPV4 => Some(SetFamily::Inet),
                        NFPROTO_IPV6 => Some(SetFamily::Inet6),
                        _ => None,
                    });
                }
                IPSET_ATTR_TYPENAME => {
                    type_name = Some(String::from_utf8_lossy(value).trim_end_matches('\0').to_string());
                }
                IPSET_ATTR_DATA => {
                    for (cadt_kind, cadt_value) in attrs(value) {
                        match cadt_kind {
                            IPSET_ATTR_TIMEOUT => timeout = true,
                            IPSET_ATTR_CADT_FLAGS if cadt_value.len() >= 4 => {
                                let flags =
                                    u32::from_be_bytes(cadt_value[0..4].try_into().unwrap());
                                comment = flags & IPSET_FLAG_WITH_COMMENT != 0;
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        let family = family.ok_or_else(|| {
            DomainError::IoError(format!("ipset '{name}': family not reported"))
        })?;
        trace!(set = name, ?family, timeout, comment, type_name, "ipset header probed");
        Ok(SetProperties {
            family,
            timeout,
            comment,
        })
    }

    fn add(&self, name: &str, ip: IpAddr, timeout: Option<u32>) -> Result<(), DomainError> {
        let (family, nf_family) = match ip {
            IpAddr::V4(_) => (SetFamily::Inet, NFPROTO_IPV4),
            IpAddr::V6(_) => (SetFamily::Inet6, NFPROTO_IPV6),
        };
        let mut socket = self.socket_for(family).lock().unwrap();
        let seq = socket.next_seq();
        let mut writer = MessageWriter::new(IPSET_CMD_ADD, nf_family, seq);
        writer.attr_u8(IPSET_ATTR_PROTOCOL, IPSET_PROTOCOL);
        writer.attr_string(IPSET_ATTR_SETNAME, name);

        let data = writer.begin_nested(IPSET_ATTR_DATA);
        let ip_attr = writer.begin_nested(IPSET_ATTR_IP);
        match ip {
            IpAddr::V4(v4) => {
                writer.attr(
                    IPSET_ATTR_IPADDR_IPV4 | NLA_F_NET_BYTEORDER,
                    &v4.octets(),
                );
            }
            IpAddr::V6(v6) => {
                writer.attr(
                    IPSET_ATTR_IPADDR_IPV6 | NLA_F_NET_BYTEORDER,
                    &v6.octets(),
                );
            }
        }
        writer.end_nested(ip_attr);
        if let Some(secs) = timeout {
            writer.attr_u32_be(IPSET_ATTR_TIMEOUT, secs);
        }
        writer.end_nested(data);

        let reply = socket.roundtrip(writer.finish())?;
        check_reply(&reply)?;
        trace!(set = name, %ip, ?timeout, "ipset entry added");
        Ok(())
    }
}
