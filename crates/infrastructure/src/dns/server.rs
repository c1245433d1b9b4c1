//! The DNS listeners and the control surface of the forwarder core.
//!
//! A configuration generation bundles the pipeline with everything derived
//! from one `DnsConfig`. `set_config` builds a new generation and swaps it
//! atomically; listeners restart only when the bind points moved.

use crate::dns::access::AccessEngine;
use crate::dns::cache::ResponseCache;
use crate::dns::filter::FilterEngine;
use crate::dns::ipset::IpsetEngine;
use crate::dns::message;
use crate::dns::pipeline::{Pipeline, PipelineSettings};
use crate::dns::ratelimit::RateLimiter;
use crate::dns::upstream::bootstrap::Bootstrapper;
use crate::dns::upstream::pool::UpstreamPool;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use homegate_application::{ClientNameSource, DnsControl};
use homegate_domain::{AccessList, ClientMatcher, DnsConfig, DomainError};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Plain-UDP answer limit for clients without EDNS.
const MIN_UDP_PAYLOAD: usize = 512;

struct Generation {
    config: DnsConfig,
    pipeline: Arc<Pipeline>,
    workers: Arc<Semaphore>,
}

/// The DNS forwarder core.
pub struct DnsServer {
    generation: ArcSwap<Generation>,
    access: Arc<AccessEngine>,
    client_names: Option<Arc<dyn ClientNameSource>>,
    listeners: Mutex<Option<ListenerSet>>,
}

struct ListenerSet {
    cancel: CancellationToken,
    tracker: TaskTracker,
    bind: ListenerBind,
}

#[derive(PartialEq, Eq, Clone)]
struct ListenerBind {
    addr: SocketAddr,
    tls_port: Option<u16>,
    quic_port: Option<u16>,
}

impl ListenerBind {
    fn from_config(config: &DnsConfig) -> Self {
        Self {
            addr: SocketAddr::new(config.bind_host, config.port),
            tls_port: config.tls_port,
            quic_port: config.quic_port,
        }
    }
}

impl DnsServer {
    /// Build the server from a validated configuration. Filter list files
    /// are read here; a missing file is a configuration error.
    pub fn new(
        config: DnsConfig,
        client_names: Option<Arc<dyn ClientNameSource>>,
    ) -> Result<Arc<Self>, DomainError> {
        config.validate()?;
        let access = Arc::new(AccessEngine::new(AccessList {
            allowed_clients: config.allowed_clients.clone(),
            disallowed_clients: config.disallowed_clients.clone(),
            blocked_hosts: config.blocked_hosts.clone(),
        })?);

        let generation = Self::build_generation(&config, &access, client_names.clone())?;
        Ok(Arc::new(Self {
            generation: ArcSwap::from_pointee(generation),
            access,
            client_names,
            listeners: Mutex::new(None),
        }))
    }

    fn build_generation(
        config: &DnsConfig,
        access: &Arc<AccessEngine>,
        client_names: Option<Arc<dyn ClientNameSource>>,
    ) -> Result<Generation, DomainError> {
        let lists = load_filter_lists(config)?;
        let filter = Arc::new(FilterEngine::new(config, &lists));

        let mut upstreams = config.upstream_dns.clone();
        if let Some(path) = &config.upstream_dns_file {
            let text = std::fs::read_to_string(path).map_err(|e| {
                DomainError::InvalidConfig(format!("read {}: {e}", path.display()))
            })?;
            upstreams.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }

        let bootstrap = Arc::new(Bootstrapper::new(&config.bootstrap_dns)?);
        let pool = Arc::new(UpstreamPool::new(
            &upstreams,
            config.upstream_policy(),
            bootstrap,
            Duration::from_millis(config.upstream_timeout_ms),
            config.bogus_nxdomain.clone(),
        )?);

        let ratelimit = Arc::new(RateLimiter::new(
            config.ratelimit,
            ClientMatcher::compile(&config.ratelimit_whitelist)?,
        ));
        let cache = ResponseCache::new(config.cache_size, config.cache_min_ttl, config.cache_max_ttl)
            .map(Arc::new);
        let ipset = build_ipset(config)?;

        let pipeline = Arc::new(Pipeline::new(
            PipelineSettings::from_config(config),
            Arc::clone(access),
            ratelimit,
            filter,
            cache,
            pool,
            ipset,
            client_names,
        ));

        Ok(Generation {
            config: config.clone(),
            pipeline,
            workers: Arc::new(Semaphore::new(config.max_inflight.max(1))),
        })
    }

    /// Bind and serve. Returns after the listener tasks are running.
    pub async fn start(self: &Arc<Self>) -> Result<(), DomainError> {
        let mut guard = self.listeners.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let bind = ListenerBind::from_config(&self.generation.load().config);
        *guard = Some(self.spawn_listeners(bind).await?);
        Ok(())
    }

    /// Stop listening and drain the in-flight workers.
    pub async fn stop(&self) {
        let Some(set) = self.listeners.lock().await.take() else {
            return;
        };
        set.cancel.cancel();
        set.tracker.close();
        set.tracker.wait().await;
        info!("DNS server stopped");
    }

    async fn spawn_listeners(
        self: &Arc<Self>,
        bind: ListenerBind,
    ) -> Result<ListenerSet, DomainError> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let udp = Arc::new(bind_udp(bind.addr)?);
        let tcp = TcpListener::bind(bind.addr)
            .await
            .map_err(|e| DomainError::IoError(format!("bind TCP {}: {e}", bind.addr)))?;
        info!(addr = %bind.addr, "DNS server listening on UDP/TCP");

        tracker.spawn(Arc::clone(self).udp_loop(Arc::clone(&udp), cancel.clone(), tracker.clone()));
        tracker.spawn(Arc::clone(self).tcp_loop(tcp, cancel.clone(), tracker.clone()));

        #[cfg(feature = "dns-over-rustls")]
        if let Some(tls_port) = bind.tls_port {
            let generation = self.generation.load_full();
            let acceptor = tls_acceptor(&generation.config)?;
            let addr = SocketAddr::new(bind.addr.ip(), tls_port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| DomainError::IoError(format!("bind DoT {addr}: {e}")))?;
            info!(%addr, "DNS-over-TLS listener ready");
            tracker.spawn(Arc::clone(self).tls_loop(listener, acceptor, cancel.clone(), tracker.clone()));
        }

        #[cfg(feature = "dns-over-quic")]
        if let Some(quic_port) = bind.quic_port {
            let generation = self.generation.load_full();
            let endpoint =
                quic_endpoint(&generation.config, SocketAddr::new(bind.addr.ip(), quic_port))?;
            info!(addr = %endpoint.local_addr().unwrap(), "DNS-over-QUIC listener ready");
            tracker.spawn(Arc::clone(self).quic_loop(endpoint, cancel.clone(), tracker.clone()));
        }

        let housekeeping_self = Arc::clone(self);
        let housekeeping_cancel = cancel.clone();
        tracker.spawn(async move {
            let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        housekeeping_self.generation.load().pipeline.ratelimiter().sweep();
                    }
                    _ = housekeeping_cancel.cancelled() => break,
                }
            }
        });

        Ok(ListenerSet {
            cancel,
            tracker,
            bind,
        })
    }

    async fn udp_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, peer) = tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };

            let generation = self.generation.load_full();
            // Over-limit requests wait here, before stage 1.
            let Ok(permit) = Arc::clone(&generation.workers).acquire_owned().await else {
                continue;
            };
            let packet = buf[..len].to_vec();
            let socket = Arc::clone(&socket);
            tracker.spawn(async move {
                let _permit = permit;
                let Ok(request) = message::parse(&packet) else {
                    debug!(client = %peer, "Undecodable UDP query dropped");
                    return;
                };
                let max_payload = request
                    .extensions()
                    .as_ref()
                    .map(|e| e.max_payload() as usize)
                    .unwrap_or(MIN_UDP_PAYLOAD)
                    .max(MIN_UDP_PAYLOAD);
                let pipeline = Arc::clone(&generation.pipeline);
                if let Some(mut response) = pipeline.handle(request, peer).await {
                    let Ok(mut bytes) = message::serialize(&response) else {
                        return;
                    };
                    if bytes.len() > max_payload {
                        response.set_truncated(true);
                        response.take_answers();
                        response.take_name_servers();
                        response.take_additionals();
                        match message::serialize(&response) {
                            Ok(truncated) => bytes = truncated,
                            Err(_) => return,
                        }
                    }
                    pipeline.ratelimiter().charge_response(peer.ip(), bytes.len());
                    if let Err(e) = socket.send_to(&bytes, peer).await {
                        debug!(client = %peer, error = %e, "UDP send failed");
                    }
                }
            });
        }
    }

    async fn tcp_loop(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                result = listener.accept() => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };
            let server = Arc::clone(&self);
            let conn_cancel = cancel.clone();
            tracker.spawn(async move {
                server.serve_stream(stream, peer, conn_cancel).await;
            });
        }
    }

    /// Serve framed queries on one stream connection until idle timeout,
    /// EOF or shutdown.
    async fn serve_stream<S>(
        self: &Arc<Self>,
        mut stream: S,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) where
        S: AsyncReadExt + AsyncWriteExt + Unpin + Send,
    {
        loop {
            let mut len_buf = [0u8; 2];
            let read = tokio::select! {
                read = tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)) => read,
                _ = cancel.cancelled() => return,
            };
            match read {
                Ok(Ok(_)) => {}
                _ => return,
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut packet = vec![0u8; len];
            if stream.read_exact(&mut packet).await.is_err() {
                return;
            }

            let generation = self.generation.load_full();
            let Ok(permit) = Arc::clone(&generation.workers).acquire_owned().await else {
                return;
            };
            let Ok(request) = message::parse(&packet) else {
                debug!(client = %peer, "Undecodable TCP query dropped");
                continue;
            };
            let response = generation.pipeline.handle(request, peer).await;
            drop(permit);

            // Stream transports close silently dropped queries.
            let Some(response) = response else { return };
            let Ok(bytes) = message::serialize(&response) else {
                return;
            };
            let framed_len = (bytes.len() as u16).to_be_bytes();
            if stream.write_all(&framed_len).await.is_err()
                || stream.write_all(&bytes).await.is_err()
            {
                return;
            }
            let _ = stream.flush().await;
        }
    }

    #[cfg(feature = "dns-over-rustls")]
    async fn tls_loop(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: tokio_rustls::TlsAcceptor,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let (tcp, peer) = tokio::select! {
                result = listener.accept() => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "DoT accept failed");
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };
            let server = Arc::clone(&self);
            let acceptor = acceptor.clone();
            let conn_cancel = cancel.clone();
            tracker.spawn(async move {
                match acceptor.accept(tcp).await {
                    Ok(stream) => server.serve_stream(stream, peer, conn_cancel).await,
                    Err(e) => debug!(client = %peer, error = %e, "DoT handshake failed"),
                }
            });
        }
    }

    #[cfg(feature = "dns-over-quic")]
    async fn quic_loop(
        self: Arc<Self>,
        endpoint: quinn::Endpoint,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let incoming = tokio::select! {
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            let server = Arc::clone(&self);
            let conn_cancel = cancel.clone();
            tracker.spawn(async move {
                let Ok(connection) = incoming.await else { return };
                let peer = connection.remote_address();
                loop {
                    let streams = tokio::select! {
                        streams = connection.accept_bi() => streams,
                        _ = conn_cancel.cancelled() => return,
                    };
                    let Ok((mut send, mut recv)) = streams else { return };

                    let mut len_buf = [0u8; 2];
                    if recv.read_exact(&mut len_buf).await.is_err() {
                        continue;
                    }
                    let mut packet = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                    if recv.read_exact(&mut packet).await.is_err() {
                        continue;
                    }
                    let generation = server.generation.load_full();
                    let Ok(request) = message::parse(&packet) else {
                        continue;
                    };
                    if let Some(response) = generation.pipeline.handle(request, peer).await {
                        if let Ok(bytes) = message::serialize(&response) {
                            let _ = send.write_all(&(bytes.len() as u16).to_be_bytes()).await;
                            let _ = send.write_all(&bytes).await;
                            let _ = send.finish();
                        }
                    }
                }
            });
        }
    }

    async fn restart_listeners(self: &Arc<Self>, bind: ListenerBind) -> Result<(), DomainError> {
        let mut guard = self.listeners.lock().await;
        if let Some(set) = guard.take() {
            set.cancel.cancel();
            set.tracker.close();
            set.tracker.wait().await;
        }
        *guard = Some(self.spawn_listeners(bind).await?);
        Ok(())
    }
}

impl DnsServer {
    /// Validate, atomically swap the configuration, and restart the
    /// listeners when the bind point moved.
    pub async fn apply_config(self: &Arc<Self>, config: DnsConfig) -> Result<(), DomainError> {
        config.validate()?;
        let generation = Self::build_generation(&config, &self.access, self.client_names.clone())?;
        let new_bind = ListenerBind::from_config(&config);
        let needs_restart = {
            let guard = self.listeners.lock().await;
            guard.as_ref().map(|set| set.bind != new_bind).unwrap_or(false)
        };
        self.generation.store(Arc::new(generation));
        info!("DNS configuration swapped");
        if needs_restart {
            info!("Listen address changed, restarting DNS listeners");
            self.restart_listeners(new_bind).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DnsControl for Arc<DnsServer> {
    async fn access_list(&self) -> AccessList {
        self.access.get()
    }

    async fn set_access_list(&self, access: AccessList) -> Result<(), DomainError> {
        self.access.set(access)
    }

    async fn set_config(&self, config: DnsConfig) -> Result<(), DomainError> {
        self.apply_config(config).await
    }
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, DomainError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DomainError::IoError(format!("create UDP socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| DomainError::IoError(e.to_string()))?;
    // Default kernel buffers overflow under bursts of DNS traffic.
    let _ = socket.set_recv_buffer_size(8 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket
        .bind(&addr.into())
        .map_err(|e| DomainError::IoError(format!("bind UDP {addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| DomainError::IoError(e.to_string()))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| DomainError::IoError(e.to_string()))
}

fn load_filter_lists(config: &DnsConfig) -> Result<Vec<(i64, Vec<String>)>, DomainError> {
    let mut lists = Vec::new();
    for filter in &config.filters {
        if !filter.enabled {
            continue;
        }
        let text = std::fs::read_to_string(&filter.path).map_err(|e| {
            DomainError::InvalidConfig(format!("read filter list {}: {e}", filter.path.display()))
        })?;
        lists.push((filter.id, text.lines().map(str::to_string).collect()));
    }
    Ok(lists)
}

fn build_ipset(config: &DnsConfig) -> Result<Option<Arc<IpsetEngine>>, DomainError> {
    if config.ipset.is_empty() {
        return Ok(None);
    }
    #[cfg(target_os = "linux")]
    {
        let channel = Arc::new(crate::dns::ipset::netlink::NetlinkIpset::open()?);
        return Ok(Some(Arc::new(IpsetEngine::new(&config.ipset, channel)?)));
    }
    #[cfg(not(target_os = "linux"))]
    {
        warn!("ipset bindings configured but unsupported on this platform");
        Ok(None)
    }
}

#[cfg(feature = "dns-over-rustls")]
fn tls_acceptor(config: &DnsConfig) -> Result<tokio_rustls::TlsAcceptor, DomainError> {
    let (cert_path, key_path) = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(DomainError::InvalidConfig(
                "TLS listener requires tls_cert and tls_key".into(),
            ))
        }
    };
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path)
            .map_err(|e| DomainError::InvalidConfig(format!("open {}: {e}", cert_path.display())))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| DomainError::InvalidConfig(format!("parse {}: {e}", cert_path.display())))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path)
            .map_err(|e| DomainError::InvalidConfig(format!("open {}: {e}", key_path.display())))?,
    ))
    .map_err(|e| DomainError::InvalidConfig(format!("parse {}: {e}", key_path.display())))?
    .ok_or_else(|| DomainError::InvalidConfig("no private key found".into()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DomainError::InvalidConfig(format!("TLS config: {e}")))?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(feature = "dns-over-quic")]
fn quic_endpoint(config: &DnsConfig, addr: SocketAddr) -> Result<quinn::Endpoint, DomainError> {
    let (cert_path, key_path) = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(DomainError::InvalidConfig(
                "QUIC listener requires tls_cert and tls_key".into(),
            ))
        }
    };
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path)
            .map_err(|e| DomainError::InvalidConfig(format!("open {}: {e}", cert_path.display())))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| DomainError::InvalidConfig(format!("parse {}: {e}", cert_path.display())))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path)
            .map_err(|e| DomainError::InvalidConfig(format!("open {}: {e}", key_path.display())))?,
    ))
    .map_err(|e| DomainError::InvalidConfig(format!("parse {}: {e}", key_path.display())))?
    .ok_or_else(|| DomainError::InvalidConfig("no private key found".into()))?;

    let mut server_tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DomainError::InvalidConfig(format!("QUIC TLS config: {e}")))?;
    server_tls.alpn_protocols = vec![b"doq".to_vec()];

    let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(server_tls)
        .map_err(|e| DomainError::InvalidConfig(format!("QUIC TLS config: {e}")))?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));
    quinn::Endpoint::server(server_config, addr)
        .map_err(|e| DomainError::IoError(format!("bind DoQ {addr}: {e}")))
}
