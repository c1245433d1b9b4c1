//! The DHCPv6 state machine: stateful address assignment from a 128-bit
//! range, DUID-LLT server identity, strict ServerID presence rules.

use crate::dhcp::leases::{unix_now, LeaseTable};
use crate::system::ifaces::InterfaceInfo;
use dhcproto::v6::{DhcpOption, DhcpOptions, IAAddr, Message, MessageType, OptionCode, IANA, ORO};
use dhcproto::{Decodable, Decoder, Encodable};
use homegate_application::{LeaseChange, LeaseChangeKind, LeaseChangeListener};
use homegate_domain::{Dhcp6Config, DomainError, Lease, LeaseMask, MacAddr};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DHCPV6_SERVER_PORT: u16 = 547;
/// All_DHCP_Relay_Agents_and_Servers (RFC 8415 §7.1).
const MULTICAST_ALL_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x1, 0x2);

/// The IPv6 half of the DHCP core.
pub struct Dhcp6Server {
    conf: Dhcp6Config,
    iface: InterfaceInfo,
    /// DUID-LLT derived from the interface hardware address.
    server_duid: Vec<u8>,
    state: Mutex<LeaseTable>,
    listener: Arc<dyn LeaseChangeListener>,
}

/// Seconds between the Unix epoch and the DUID time base (2000-01-01).
const DUID_TIME_BASE: i64 = 946_684_800;

/// DUID-LLT: type 1, hardware type 1 (Ethernet), a 4-byte time field,
/// then the MAC (RFC 8415 §11.2).
fn duid_llt(mac: MacAddr) -> Vec<u8> {
    let time = unix_now().saturating_sub(DUID_TIME_BASE) as u32;
    let mut duid = Vec::with_capacity(14);
    duid.extend_from_slice(&1u16.to_be_bytes());
    duid.extend_from_slice(&1u16.to_be_bytes());
    duid.extend_from_slice(&time.to_be_bytes());
    duid.extend_from_slice(mac.as_bytes());
    duid
}

/// Recover the client MAC from a DUID-LL or DUID-LLT; other DUID forms
/// cannot be keyed into the lease table and are dropped.
fn mac_from_duid(duid: &[u8]) -> Option<MacAddr> {
    if duid.len() < 2 {
        return None;
    }
    let duid_type = u16::from_be_bytes([duid[0], duid[1]]);
    let mac_bytes = match duid_type {
        // DUID-LLT: type(2) hwtype(2) time(4) mac(6)
        1 if duid.len() >= 14 => &duid[8..14],
        // DUID-LL: type(2) hwtype(2) mac(6)
        3 if duid.len() >= 10 => &duid[4..10],
        _ => return None,
    };
    MacAddr::try_from(mac_bytes).ok()
}

impl Dhcp6Server {
    pub fn new(
        conf: Dhcp6Config,
        iface: InterfaceInfo,
        listener: Arc<dyn LeaseChangeListener>,
    ) -> Result<Self, DomainError> {
        conf.validate()?;
        let server_duid = duid_llt(iface.mac);
        Ok(Self {
            conf,
            iface,
            server_duid,
            state: Mutex::new(LeaseTable::new()),
            listener,
        })
    }

    /// Bind UDP :547, join the all-servers multicast group and serve.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), DomainError> {
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            DHCPV6_SERVER_PORT,
        ))
        .await
        .map_err(|e| DomainError::IoError(format!("bind DHCPv6 :547: {e}")))?;
        socket
            .join_multicast_v6(&MULTICAST_ALL_SERVERS, self.iface.index)
            .map_err(|e| DomainError::IoError(format!("join ff02::1:2: {e}")))?;
        info!(iface = %self.iface.name, "DHCPv6 server listening on :547");

        let mut buf = vec![0u8; 1500];
        loop {
            let (len, peer) = tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "DHCPv6 receive failed");
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };

            let request = match Message::decode(&mut Decoder::new(&buf[..len])) {
                Ok(message) => message,
                Err(e) => {
                    debug!(%peer, error = %e, "Undecodable DHCPv6 packet dropped");
                    continue;
                }
            };

            if let Some(reply) = self.handle(&request).await {
                match reply.to_vec() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, peer).await {
                            warn!(%peer, error = %e, "DHCPv6 send failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "DHCPv6 encode failed"),
                }
            }
        }
        info!("DHCPv6 server stopped");
        Ok(())
    }

    /// ServerID must be absent on Solicit/Confirm/Rebind, present and
    /// matching everywhere else it is defined.
    fn server_id_valid(&self, request: &Message) -> bool {
        let server_id = match request.opts().get(OptionCode::ServerId) {
            Some(DhcpOption::ServerId(id)) => Some(id.as_slice()),
            _ => None,
        };
        match request.msg_type() {
            MessageType::Solicit | MessageType::Confirm | MessageType::Rebind => {
                server_id.is_none()
            }
            MessageType::Request
            | MessageType::Renew
            | MessageType::Release
            | MessageType::Decline => server_id == Some(self.server_duid.as_slice()),
            MessageType::InformationRequest => {
                server_id.is_none() || server_id == Some(self.server_duid.as_slice())
            }
            _ => false,
        }
    }

    pub(crate) async fn handle(&self, request: &Message) -> Option<Message> {
        if !self.server_id_valid(request) {
            debug!(msg_type = ?request.msg_type(), "ServerID rules violated, dropping");
            return None;
        }

        let client_id = match request.opts().get(OptionCode::ClientId) {
            Some(DhcpOption::ClientId(id)) => id.clone(),
            _ => {
                debug!(msg_type = ?request.msg_type(), "Missing ClientId, dropping");
                return None;
            }
        };

        match request.msg_type() {
            MessageType::Solicit => {
                let rapid = request.opts().get(OptionCode::RapidCommit).is_some();
                let msg_type = if rapid {
                    MessageType::Reply
                } else {
                    MessageType::Advertise
                };
                self.answer_with_address(request, &client_id, msg_type, rapid)
                    .await
            }
            MessageType::Request | MessageType::Renew | MessageType::Rebind => {
                self.answer_with_address(request, &client_id, MessageType::Reply, true)
                    .await
            }
            MessageType::Confirm => Some(self.base_reply(request, &client_id)),
            MessageType::Release | MessageType::Decline => {
                info!(msg_type = ?request.msg_type(), "DHCPv6 client state message observed");
                Some(self.base_reply(request, &client_id))
            }
            MessageType::InformationRequest => {
                let mut reply = self.base_reply(request, &client_id);
                self.add_dns_if_requested(request, &mut reply);
                Some(reply)
            }
            other => {
                debug!(?other, "Unhandled DHCPv6 message type");
                None
            }
        }
    }

    async fn answer_with_address(
        &self,
        request: &Message,
        client_id: &[u8],
        msg_type: MessageType,
        commit: bool,
    ) -> Option<Message> {
        let mac = match mac_from_duid(client_id) {
            Some(mac) if !mac.is_zero() => mac,
            _ => {
                debug!("Client DUID carries no usable hardware address, dropping");
                return None;
            }
        };
        let iaid = match request.opts().get(OptionCode::IANA) {
            Some(DhcpOption::IANA(iana)) => iana.id,
            _ => {
                debug!(%mac, "Message without IA_NA, dropping");
                return None;
            }
        };

        let mut state = self.state.lock().await;
        let addr = match state.find_by_mac(mac) {
            Some(lease) => match lease.ip {
                IpAddr::V6(v6) => v6,
                IpAddr::V4(_) => return None,
            },
            None => self.next_free(&state)?,
        };

        let lease = Lease {
            mac,
            ip: IpAddr::V6(addr),
            hostname: String::new(),
            expiry: if commit {
                unix_now() + self.conf.lease_duration_secs as i64
            } else {
                0
            },
        };
        if let Err(e) = state.commit_dynamic(lease.clone()) {
            warn!(%mac, error = %e, "DHCPv6 lease commit failed");
            return None;
        }
        drop(state);

        if commit {
            self.listener.lease_changed(LeaseChange {
                kind: LeaseChangeKind::Committed,
                lease: Some(lease),
            });
            info!(%mac, %addr, "DHCPv6 lease committed");
        } else {
            debug!(%mac, %addr, "DHCPv6 address advertised");
        }

        let mut reply = Message::new_with_id(msg_type, request.xid());
        let opts = reply.opts_mut();
        opts.insert(DhcpOption::ClientId(client_id.to_vec()));
        opts.insert(DhcpOption::ServerId(self.server_duid.clone()));

        let lifetime = self.conf.lease_duration_secs;
        let mut ia_opts = DhcpOptions::new();
        ia_opts.insert(DhcpOption::IAAddr(IAAddr {
            addr,
            preferred_life: lifetime,
            valid_life: lifetime,
            opts: DhcpOptions::new(),
        }));
        opts.insert(DhcpOption::IANA(IANA {
            id: iaid,
            t1: lifetime / 2,
            t2: lifetime * 4 / 5,
            opts: ia_opts,
        }));

        let mut reply = reply;
        self.add_dns_if_requested(request, &mut reply);
        Some(reply)
    }

    /// Next unused address counting up from `range_start` in the 128-bit
    /// space, /120 by convention.
    fn next_free(&self, table: &LeaseTable) -> Option<Ipv6Addr> {
        let start = u128::from(self.conf.range_start);
        for offset in 0..=0xffu128 {
            let candidate = Ipv6Addr::from(start + offset);
            if !self.conf.range_contains(candidate) {
                break;
            }
            if table.find_by_ip(IpAddr::V6(candidate)).is_none() {
                return Some(candidate);
            }
        }
        warn!("DHCPv6 address range exhausted");
        None
    }

    fn base_reply(&self, request: &Message, client_id: &[u8]) -> Message {
        let mut reply = Message::new_with_id(MessageType::Reply, request.xid());
        let opts = reply.opts_mut();
        opts.insert(DhcpOption::ClientId(client_id.to_vec()));
        opts.insert(DhcpOption::ServerId(self.server_duid.clone()));
        reply
    }

    fn add_dns_if_requested(&self, request: &Message, reply: &mut Message) {
        let wants_dns = match request.opts().get(OptionCode::ORO) {
            Some(DhcpOption::ORO(ORO { opts })) => {
                opts.contains(&OptionCode::DomainNameServers)
            }
            _ => false,
        };
        if wants_dns && !self.iface.ipv6.is_empty() {
            reply
                .opts_mut()
                .insert(DhcpOption::DomainNameServers(self.iface.ipv6.clone()));
        }
    }

    // Control-plane operations.

    pub async fn leases(&self, mask: LeaseMask) -> Vec<Lease> {
        self.state.lock().await.leases(mask)
    }

    pub async fn find_mac_by_ip(&self, ip: IpAddr) -> Option<MacAddr> {
        self.state.lock().await.find_by_ip(ip).map(|l| l.mac)
    }

    pub async fn add_static_lease(&self, lease: Lease) -> Result<(), DomainError> {
        if !matches!(lease.ip, IpAddr::V6(_)) {
            return Err(DomainError::InvalidIpAddress(format!(
                "{} is not IPv6",
                lease.ip
            )));
        }
        self.state.lock().await.add_static(lease.clone())?;
        self.listener.lease_changed(LeaseChange {
            kind: LeaseChangeKind::Committed,
            lease: Some(lease),
        });
        Ok(())
    }

    pub async fn remove_static_lease(&self, lease: Lease) -> Result<(), DomainError> {
        self.state.lock().await.remove_static(&lease)?;
        self.listener.lease_changed(LeaseChange {
            kind: LeaseChangeKind::Removed,
            lease: Some(lease),
        });
        Ok(())
    }

    pub async fn reset_leases(&self, leases: Vec<Lease>) {
        let conf = self.conf.clone();
        let mut state = self.state.lock().await;
        let skipped = state.reset(leases, |lease| match lease.ip {
            IpAddr::V6(ip) => lease.is_static() || conf.range_contains(ip),
            IpAddr::V4(_) => false,
        });
        if skipped > 0 {
            warn!(skipped, "Stored IPv6 leases outside the configured range were skipped");
        }
        info!(count = state.len(), "IPv6 lease table loaded");
        drop(state);

        self.listener.lease_changed(LeaseChange {
            kind: LeaseChangeKind::TableReplaced,
            lease: None,
        });
    }
}
