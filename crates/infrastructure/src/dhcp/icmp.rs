//! ICMP conflict probing: before offering an address, ask the network
//! whether anything already answers on it.

use socket2::{Domain, Protocol, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::debug;

/// Answers "is this address already in use?". Mocked in tests; the real
/// implementation sends one echo request and waits for any reply.
pub trait ConflictProber: Send + Sync {
    fn in_use(&self, ip: Ipv4Addr, timeout: Duration) -> bool;
}

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum = sum.wrapping_add(word as u32);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn echo_request(ident: u16, seq: u16) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[8..16].copy_from_slice(b"homegate");
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// Echo prober over an ICMP datagram socket (no raw-socket capability
/// needed on Linux when `ping_group_range` admits us).
pub struct IcmpProber;

impl IcmpProber {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictProber for IcmpProber {
    fn in_use(&self, ip: Ipv4Addr, timeout: Duration) -> bool {
        let socket = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
            .or_else(|_| Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)))
        {
            Ok(socket) => socket,
            Err(e) => {
                debug!(error = %e, "Cannot open ICMP socket, skipping conflict probe");
                return false;
            }
        };

        let packet = echo_request(fastrand::u16(..), 1);
        let target = SocketAddrV4::new(ip, 0);
        if socket.send_to(&packet, &target.into()).is_err() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [MaybeUninit::<u8>::uninit(); 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if socket.set_read_timeout(Some(remaining)).is_err() {
                return false;
            }
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    let data: &[u8] =
                        unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
                    // Raw sockets hand back the IP header; datagram sockets
                    // start at the ICMP header.
                    let icmp = if len >= 20 && data[0] >> 4 == 4 {
                        &data[((data[0] & 0x0f) as usize * 4)..]
                    } else {
                        data
                    };
                    if icmp.first() == Some(&ICMP_ECHO_REPLY) {
                        debug!(%ip, "Conflict probe got an echo reply");
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_zeroes() {
        assert_eq!(checksum(&[0, 0, 0, 0]), 0xffff);
    }

    #[test]
    fn echo_request_checksum_validates() {
        let packet = echo_request(0x1234, 1);
        // Re-computing over the checksummed packet must yield zero.
        assert_eq!(checksum(&packet), 0);
    }
}
