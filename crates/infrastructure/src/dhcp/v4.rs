//! The DHCPv4 state machine: Discover/Request/Decline/Release/Inform over
//! one interface, with conflict probing and pool allocation.

use crate::dhcp::icmp::ConflictProber;
use crate::dhcp::leases::{unix_now, LeaseTable};
use crate::system::ifaces::InterfaceInfo;
use dhcproto::v4::{
    DhcpOption, Flags, HType, Message, MessageType, Opcode, OptionCode, UnknownOption,
};
use dhcproto::{Decodable, Decoder, Encodable};
use homegate_application::{LeaseChange, LeaseChangeKind, LeaseChangeListener};
use homegate_domain::{Dhcp4Config, DomainError, Lease, LeaseMask, MacAddr, RawDhcpOption};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

struct V4State {
    table: LeaseTable,
    /// Occupancy by last octet within the /24 pool.
    taken: [bool; 256],
}

impl V4State {
    fn new() -> Self {
        Self {
            table: LeaseTable::new(),
            taken: [false; 256],
        }
    }

    fn mark(&mut self, ip: Ipv4Addr, occupied: bool) {
        self.taken[ip.octets()[3] as usize] = occupied;
    }

    fn is_taken(&self, ip: Ipv4Addr) -> bool {
        self.taken[ip.octets()[3] as usize]
    }

    fn rebuild_bitmap(&mut self) {
        self.taken = [false; 256];
        let occupied: Vec<Ipv4Addr> = self
            .table
            .iter()
            .filter_map(|l| match l.ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        for ip in occupied {
            self.mark(ip, true);
        }
    }
}

/// The IPv4 half of the DHCP core.
pub struct Dhcp4Server {
    conf: Dhcp4Config,
    iface: InterfaceInfo,
    server_id: Ipv4Addr,
    raw_options: Vec<RawDhcpOption>,
    state: Mutex<V4State>,
    prober: Arc<dyn ConflictProber>,
    listener: Arc<dyn LeaseChangeListener>,
}

impl Dhcp4Server {
    pub fn new(
        conf: Dhcp4Config,
        iface: InterfaceInfo,
        prober: Arc<dyn ConflictProber>,
        listener: Arc<dyn LeaseChangeListener>,
    ) -> Result<Self, DomainError> {
        conf.validate()?;
        let server_id = iface.first_ipv4()?;
        let raw_options = conf.parsed_options()?;
        Ok(Self {
            conf,
            iface,
            server_id,
            raw_options,
            state: Mutex::new(V4State::new()),
            prober,
            listener,
        })
    }

    pub fn server_id(&self) -> Ipv4Addr {
        self.server_id
    }

    /// Bind UDP :67 on the configured interface and serve until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), DomainError> {
        let socket = Arc::new(self.bind_socket()?);
        info!(iface = %self.iface.name, server_id = %self.server_id, "DHCPv4 server listening on :67");

        let mut buf = vec![0u8; 1500];
        loop {
            let (len, peer) = tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "DHCPv4 receive failed");
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };

            let request = match Message::decode(&mut Decoder::new(&buf[..len])) {
                Ok(message) => message,
                Err(e) => {
                    debug!(%peer, error = %e, "Undecodable DHCPv4 packet dropped");
                    continue;
                }
            };
            if request.opcode() != Opcode::BootRequest {
                continue;
            }

            if let Some(reply) = self.handle(&request).await {
                let dest = reply_destination(&request, &reply);
                match reply.to_vec() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, dest).await {
                            warn!(%dest, error = %e, "DHCPv4 send failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "DHCPv4 encode failed"),
                }
            }
        }
        info!("DHCPv4 server stopped");
        Ok(())
    }

    fn bind_socket(&self) -> Result<UdpSocket, DomainError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| DomainError::IoError(format!("create DHCPv4 socket: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| DomainError::IoError(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DomainError::IoError(e.to_string()))?;
        #[cfg(target_os = "linux")]
        socket
            .bind_device(Some(self.iface.name.as_bytes()))
            .map_err(|e| {
                DomainError::IoError(format!("bind to device {}: {e}", self.iface.name))
            })?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket
            .bind(&SocketAddr::V4(addr).into())
            .map_err(|e| DomainError::IoError(format!("bind DHCPv4 :67: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DomainError::IoError(e.to_string()))?;
        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|e| DomainError::IoError(e.to_string()))
    }

    async fn handle(&self, request: &Message) -> Option<Message> {
        let msg_type = request.opts().msg_type()?;
        let mac = client_mac(request)?;

        match msg_type {
            MessageType::Discover => self.handle_discover(request, mac).await,
            MessageType::Request => self.handle_request(request, mac).await,
            MessageType::Decline => {
                info!(%mac, "DHCPv4 Decline observed");
                None
            }
            MessageType::Release => {
                info!(%mac, ciaddr = %request.ciaddr(), "DHCPv4 Release observed");
                None
            }
            MessageType::Inform => {
                debug!(%mac, "DHCPv4 Inform answered with options only");
                Some(self.build_reply(request, MessageType::Ack, Ipv4Addr::UNSPECIFIED))
            }
            other => {
                debug!(%mac, ?other, "Unhandled DHCPv4 message type");
                None
            }
        }
    }

    async fn handle_discover(&self, request: &Message, mac: MacAddr) -> Option<Message> {
        let hostname = requested_hostname(request);

        let mut state = self.state.lock().await;

        // A known client keeps its address, static or dynamic.
        if let Some(lease) = state.table.find_by_mac(mac) {
            if let IpAddr::V4(ip) = lease.ip {
                debug!(%mac, %ip, "Offering existing lease");
                return Some(self.build_reply(request, MessageType::Offer, ip));
            }
        }

        let Some(candidate) = self.allocate(&mut state, mac, hostname.clone()).await else {
            warn!(%mac, "Address pool exhausted, dropping Discover");
            return None;
        };

        // Reserve under expiry 0: visible to allocation, excluded from the
        // database until the client commits with Request.
        let reservation = Lease {
            mac,
            ip: IpAddr::V4(candidate),
            hostname: hostname.unwrap_or_default(),
            expiry: 0,
        };
        if let Err(e) = state.table.commit_dynamic(reservation) {
            warn!(%mac, ip = %candidate, error = %e, "Reservation failed");
            return None;
        }
        state.mark(candidate, true);

        debug!(%mac, ip = %candidate, "Offering new address");
        Some(self.build_reply(request, MessageType::Offer, candidate))
    }

    /// Scan the pool for a free slot, conflict-probing each candidate.
    /// Falls back to recycling the oldest expired dynamic lease.
    async fn allocate(
        &self,
        state: &mut V4State,
        mac: MacAddr,
        _hostname: Option<String>,
    ) -> Option<Ipv4Addr> {
        let start = u32::from(self.conf.range_start);
        let end = u32::from(self.conf.range_end);

        for raw in start..=end {
            let candidate = Ipv4Addr::from(raw);
            if state.is_taken(candidate) || state.table.find_by_ip(IpAddr::V4(candidate)).is_some()
            {
                continue;
            }
            if self.probe_conflict(candidate).await {
                info!(ip = %candidate, "Address answers pings, blacklisting");
                state.table.park_blacklisted(
                    IpAddr::V4(candidate),
                    unix_now() + self.conf.lease_duration_secs as i64,
                );
                state.mark(candidate, true);
                continue;
            }
            return Some(candidate);
        }

        // Recycle the oldest expired dynamic lease, blacklisted ones
        // included.
        let now = unix_now();
        let expired = state.table.oldest_expired(now)?.clone();
        if let IpAddr::V4(ip) = expired.ip {
            debug!(%mac, %ip, "Recycling expired lease");
            state.table.remove_by_ip(expired.ip);
            state.mark(ip, false);
            return Some(ip);
        }
        None
    }

    async fn probe_conflict(&self, ip: Ipv4Addr) -> bool {
        if self.conf.icmp_timeout_ms == 0 {
            return false;
        }
        let prober = Arc::clone(&self.prober);
        let timeout = Duration::from_millis(self.conf.icmp_timeout_ms);
        tokio::task::spawn_blocking(move || prober.in_use(ip, timeout))
            .await
            .unwrap_or(false)
    }

    async fn handle_request(&self, request: &Message, mac: MacAddr) -> Option<Message> {
        // A Request addressed at another server is not ours to answer.
        if let Some(DhcpOption::ServerIdentifier(server)) =
            request.opts().get(OptionCode::ServerIdentifier)
        {
            if *server != self.server_id {
                debug!(%mac, foreign = %server, "Request for another DHCP server, dropping");
                return None;
            }
        }

        let requested_ip = match request.opts().get(OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(ip)) => *ip,
            _ => request.ciaddr(),
        };
        let hostname = requested_hostname(request);

        let mut state = self.state.lock().await;
        let Some(lease) = state.table.find_by_mac(mac).cloned() else {
            debug!(%mac, "Request from unknown client, answering NAK");
            return Some(self.build_nak(request));
        };

        if lease.ip != IpAddr::V4(requested_ip) {
            debug!(%mac, requested = %requested_ip, leased = %lease.ip, "Requested address mismatch, NAK");
            return Some(self.build_nak(request));
        }
        if let Some(name) = &hostname {
            if !lease.hostname.is_empty() && &lease.hostname != name {
                debug!(%mac, requested = %name, leased = %lease.hostname, "Hostname mismatch, NAK");
                return Some(self.build_nak(request));
            }
        }

        if lease.is_static() {
            // Static leases are acknowledged as-is; expiry never moves.
            debug!(%mac, ip = %requested_ip, "Static lease acknowledged");
            return Some(self.build_reply(request, MessageType::Ack, requested_ip));
        }

        let renewed = Lease {
            mac,
            ip: lease.ip,
            hostname: hostname.unwrap_or(lease.hostname),
            expiry: unix_now() + self.conf.lease_duration_secs as i64,
        };
        if let Err(e) = state.table.commit_dynamic(renewed.clone()) {
            warn!(%mac, error = %e, "Lease renewal failed");
            return Some(self.build_nak(request));
        }
        drop(state);

        self.listener.lease_changed(LeaseChange {
            kind: LeaseChangeKind::Committed,
            lease: Some(renewed),
        });

        info!(%mac, ip = %requested_ip, "DHCPv4 lease acknowledged");
        Some(self.build_reply(request, MessageType::Ack, requested_ip))
    }

    fn build_reply(&self, request: &Message, msg_type: MessageType, yiaddr: Ipv4Addr) -> Message {
        let mut reply = Message::default();
        reply
            .set_opcode(Opcode::BootReply)
            .set_htype(HType::Eth)
            .set_xid(request.xid())
            .set_flags(request.flags())
            .set_ciaddr(request.ciaddr())
            .set_yiaddr(yiaddr)
            .set_siaddr(self.server_id)
            .set_giaddr(request.giaddr())
            .set_chaddr(request.chaddr());

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(msg_type));
        opts.insert(DhcpOption::ServerIdentifier(self.server_id));
        opts.insert(DhcpOption::AddressLeaseTime(self.conf.lease_duration_secs));
        opts.insert(DhcpOption::SubnetMask(self.conf.subnet_mask));
        opts.insert(DhcpOption::Router(vec![self.conf.gateway_ip]));
        opts.insert(DhcpOption::DomainNameServer(self.iface.ipv4.clone()));
        for raw in &self.raw_options {
            opts.insert(DhcpOption::Unknown(UnknownOption::new(
                OptionCode::from(raw.code),
                raw.data.clone(),
            )));
        }
        reply
    }

    fn build_nak(&self, request: &Message) -> Message {
        let mut reply = Message::default();
        reply
            .set_opcode(Opcode::BootReply)
            .set_htype(HType::Eth)
            .set_xid(request.xid())
            .set_flags(Flags::default().set_broadcast())
            .set_giaddr(request.giaddr())
            .set_chaddr(request.chaddr());
        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(MessageType::Nak));
        opts.insert(DhcpOption::ServerIdentifier(self.server_id));
        reply
    }

    // Control-plane operations, shared with the facade.

    pub async fn leases(&self, mask: LeaseMask) -> Vec<Lease> {
        self.state.lock().await.table.leases(mask)
    }

    pub async fn find_mac_by_ip(&self, ip: IpAddr) -> Option<MacAddr> {
        self.state
            .lock()
            .await
            .table
            .find_by_ip(ip)
            .map(|l| l.mac)
    }

    pub async fn hostname_for_ip(&self, ip: IpAddr) -> Option<String> {
        let state = self.state.lock().await;
        let lease = state.table.find_by_ip(ip)?;
        (!lease.hostname.is_empty()).then(|| lease.hostname.clone())
    }

    /// Lock-free-ish variant for the DNS side's sync reverse-lookup port;
    /// contention reads as "no name".
    pub fn try_hostname_for_ip(&self, ip: IpAddr) -> Option<String> {
        let state = self.state.try_lock().ok()?;
        let lease = state.table.find_by_ip(ip)?;
        (!lease.hostname.is_empty()).then(|| lease.hostname.clone())
    }

    pub async fn add_static_lease(&self, lease: Lease) -> Result<(), DomainError> {
        let IpAddr::V4(ip) = lease.ip else {
            return Err(DomainError::InvalidIpAddress(format!(
                "{} is not IPv4",
                lease.ip
            )));
        };
        if !self.conf.subnet_contains(ip) {
            return Err(DomainError::InvalidIpAddress(format!(
                "{ip} is outside the served subnet"
            )));
        }
        {
            let mut state = self.state.lock().await;
            state.table.add_static(lease.clone())?;
            state.mark(ip, true);
        }
        self.listener.lease_changed(LeaseChange {
            kind: LeaseChangeKind::Committed,
            lease: Some(lease),
        });
        Ok(())
    }

    pub async fn remove_static_lease(&self, lease: Lease) -> Result<(), DomainError> {
        {
            let mut state = self.state.lock().await;
            state.table.remove_static(&lease)?;
            if let IpAddr::V4(ip) = lease.ip {
                state.mark(ip, false);
            }
        }
        self.listener.lease_changed(LeaseChange {
            kind: LeaseChangeKind::Removed,
            lease: Some(lease),
        });
        Ok(())
    }

    /// Replace the table from the store; out-of-range dynamic leases are
    /// logged and skipped, static leases only need to be inside the subnet.
    pub async fn reset_leases(&self, leases: Vec<Lease>) {
        let conf = self.conf.clone();
        let mut state = self.state.lock().await;
        let skipped = state.table.reset(leases, |lease| match lease.ip {
            IpAddr::V4(ip) => {
                if lease.is_static() {
                    conf.subnet_contains(ip)
                } else {
                    conf.range_contains(ip)
                }
            }
            IpAddr::V6(_) => false,
        });
        state.rebuild_bitmap();
        if skipped > 0 {
            warn!(skipped, "Stored IPv4 leases outside the configured range were skipped");
        }
        info!(count = state.table.len(), "IPv4 lease table loaded");
        drop(state);

        self.listener.lease_changed(LeaseChange {
            kind: LeaseChangeKind::TableReplaced,
            lease: None,
        });
    }
}

fn client_mac(request: &Message) -> Option<MacAddr> {
    let chaddr = request.chaddr();
    if chaddr.len() < 6 {
        return None;
    }
    let mac = MacAddr::try_from(&chaddr[..6]).ok()?;
    // A zero hardware address is client misbehavior; drop silently.
    (!mac.is_zero()).then_some(mac)
}

fn requested_hostname(request: &Message) -> Option<String> {
    match request.opts().get(OptionCode::Hostname) {
        Some(DhcpOption::Hostname(name)) if !name.is_empty() => Some(name.clone()),
        _ => None,
    }
}

fn reply_destination(request: &Message, reply: &Message) -> SocketAddr {
    if request.giaddr() != Ipv4Addr::UNSPECIFIED {
        return SocketAddr::new(IpAddr::V4(request.giaddr()), DHCP_SERVER_PORT);
    }
    if request.flags().broadcast() || reply.yiaddr() == Ipv4Addr::UNSPECIFIED {
        return SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT);
    }
    SocketAddr::new(IpAddr::V4(reply.yiaddr()), DHCP_CLIENT_PORT)
}
