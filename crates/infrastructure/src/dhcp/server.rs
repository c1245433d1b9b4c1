//! The DHCP facade: lifecycle, persistence wiring, and the control surface
//! shared with the HTTP adapter.

use crate::dhcp::icmp::{ConflictProber, IcmpProber};
use crate::dhcp::probe;
use crate::dhcp::store::{self, StoreWriter};
use crate::dhcp::v4::Dhcp4Server;
use crate::dhcp::v6::Dhcp6Server;
use crate::system::ifaces::interface_info;
use async_trait::async_trait;
use homegate_application::{
    ClientNameSource, DhcpControl, LeaseChange, LeaseChangeListener, OtherServerAnswer,
    ProbeReport, StaticIpCheck,
};
use homegate_domain::{DhcpConfig, DomainError, Lease, LeaseMask, MacAddr};
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

struct Running {
    v4: Option<Arc<Dhcp4Server>>,
    v6: Option<Arc<Dhcp6Server>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Collects a full snapshot from both families after every change and
/// hands it to the store writer. Change notifications stay ordered per
/// family; the snapshot itself is taken asynchronously.
struct PersistListener {
    inner: OnceLock<(Option<Arc<Dhcp4Server>>, Option<Arc<Dhcp6Server>>, StoreWriter)>,
}

impl PersistListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: OnceLock::new(),
        })
    }

    fn wire(
        &self,
        v4: Option<Arc<Dhcp4Server>>,
        v6: Option<Arc<Dhcp6Server>>,
        store: StoreWriter,
    ) {
        let _ = self.inner.set((v4, v6, store));
    }
}

impl LeaseChangeListener for PersistListener {
    fn lease_changed(&self, _change: LeaseChange) {
        let Some((v4, v6, store)) = self.inner.get().cloned() else {
            return;
        };
        tokio::spawn(async move {
            let mut snapshot = Vec::new();
            if let Some(v4) = &v4 {
                snapshot.extend(v4.leases(LeaseMask::All).await);
            }
            if let Some(v6) = &v6 {
                snapshot.extend(v6.leases(LeaseMask::All).await);
            }
            store.persist(snapshot);
        });
    }
}

/// The DHCP core as one unit: both family servers plus their shared store.
pub struct DhcpServer {
    state: Mutex<State>,
    static_ip_check: Arc<dyn StaticIpCheck>,
    prober: Arc<dyn ConflictProber>,
}

struct State {
    config: DhcpConfig,
    running: Option<Running>,
}

impl DhcpServer {
    pub fn new(
        config: DhcpConfig,
        static_ip_check: Arc<dyn StaticIpCheck>,
    ) -> Result<Arc<Self>, DomainError> {
        config.validate()?;
        Ok(Arc::new(Self {
            state: Mutex::new(State {
                config,
                running: None,
            }),
            static_ip_check,
            prober: Arc::new(IcmpProber::new()),
        }))
    }

    /// Start both family servers on the configured interface and load the
    /// lease database into them.
    pub async fn start(self: &Arc<Self>) -> Result<(), DomainError> {
        let mut state = self.state.lock().await;
        if state.running.is_some() || !state.config.enabled {
            return Ok(());
        }
        let iface = interface_info(&state.config.interface_name)?;
        let db_path = state.config.db_path();

        let listener = PersistListener::new();
        let listener_dyn: Arc<dyn LeaseChangeListener> = listener.clone();

        let v4 = state
            .config
            .conf4
            .as_ref()
            .map(|conf4| {
                Dhcp4Server::new(
                    conf4.clone(),
                    iface.clone(),
                    Arc::clone(&self.prober),
                    Arc::clone(&listener_dyn),
                )
                .map(Arc::new)
            })
            .transpose()?;
        let v6 = state
            .config
            .conf6
            .as_ref()
            .map(|conf6| {
                Dhcp6Server::new(conf6.clone(), iface.clone(), Arc::clone(&listener_dyn))
                    .map(Arc::new)
            })
            .transpose()?;

        let store_writer = StoreWriter::spawn(db_path.clone());
        listener.wire(v4.clone(), v6.clone(), store_writer);

        // Load the database before serving so reused addresses survive a
        // restart.
        let loaded = store::load(&db_path);
        if let Some(v4) = &v4 {
            v4.reset_leases(loaded.v4).await;
        }
        if let Some(v6) = &v6 {
            v6.reset_leases(loaded.v6).await;
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        if let Some(v4) = v4.clone() {
            let cancel = cancel.clone();
            tracker.spawn(async move {
                if let Err(e) = v4.run(cancel).await {
                    warn!(error = %e, "DHCPv4 server exited with error");
                }
            });
        }
        if let Some(v6) = v6.clone() {
            let cancel = cancel.clone();
            tracker.spawn(async move {
                if let Err(e) = v6.run(cancel).await {
                    warn!(error = %e, "DHCPv6 server exited with error");
                }
            });
        }

        state.running = Some(Running {
            v4,
            v6,
            cancel,
            tracker,
        });
        info!(iface = %iface.name, "DHCP server started");
        Ok(())
    }

    pub async fn stop(&self) {
        let running = {
            let mut state = self.state.lock().await;
            state.running.take()
        };
        if let Some(running) = running {
            running.cancel.cancel();
            running.tracker.close();
            running.tracker.wait().await;
            info!("DHCP server stopped");
        }
    }

    async fn servers(&self) -> (Option<Arc<Dhcp4Server>>, Option<Arc<Dhcp6Server>>) {
        let state = self.state.lock().await;
        match &state.running {
            Some(running) => (running.v4.clone(), running.v6.clone()),
            None => (None, None),
        }
    }
}

#[async_trait]
impl DhcpControl for Arc<DhcpServer> {
    async fn leases(&self, mask: LeaseMask) -> Vec<Lease> {
        let (v4, v6) = self.servers().await;
        let mut all = Vec::new();
        if let Some(v4) = v4 {
            all.extend(v4.leases(mask).await);
        }
        if let Some(v6) = v6 {
            all.extend(v6.leases(mask).await);
        }
        all
    }

    async fn find_mac_by_ip(&self, ip: IpAddr) -> Option<MacAddr> {
        let (v4, v6) = self.servers().await;
        match ip {
            IpAddr::V4(_) => match v4 {
                Some(v4) => v4.find_mac_by_ip(ip).await,
                None => None,
            },
            IpAddr::V6(_) => match v6 {
                Some(v6) => v6.find_mac_by_ip(ip).await,
                None => None,
            },
        }
    }

    async fn add_static_lease(&self, lease: Lease) -> Result<(), DomainError> {
        lease.validate()?;
        let (v4, v6) = self.servers().await;
        match lease.ip {
            IpAddr::V4(_) => match v4 {
                Some(v4) => v4.add_static_lease(lease).await,
                None => Err(DomainError::NotRunning),
            },
            IpAddr::V6(_) => match v6 {
                Some(v6) => v6.add_static_lease(lease).await,
                None => Err(DomainError::NotRunning),
            },
        }
    }

    async fn remove_static_lease(&self, lease: Lease) -> Result<(), DomainError> {
        lease.validate()?;
        let (v4, v6) = self.servers().await;
        match lease.ip {
            IpAddr::V4(_) => match v4 {
                Some(v4) => v4.remove_static_lease(lease).await,
                None => Err(DomainError::NotRunning),
            },
            IpAddr::V6(_) => match v6 {
                Some(v6) => v6.remove_static_lease(lease).await,
                None => Err(DomainError::NotRunning),
            },
        }
    }

    async fn set_config(&self, config: DhcpConfig) -> Result<(), DomainError> {
        config.validate()?;
        self.stop().await;
        {
            let mut state = self.state.lock().await;
            state.config = config;
        }
        let enabled = self.state.lock().await.config.enabled;
        if enabled {
            self.start().await?;
        }
        info!("DHCP configuration swapped");
        Ok(())
    }

    async fn find_active_dhcp(&self, iface_name: &str) -> ProbeReport {
        let iface = match interface_info(iface_name) {
            Ok(iface) => iface,
            Err(e) => {
                let err = OtherServerAnswer::Error(e.to_string());
                return ProbeReport {
                    v4_other_server: err.clone(),
                    v4_static_ip: err.clone(),
                    v6_other_server: err,
                };
            }
        };

        let v4_other_server = answer(probe::other_server_present_v4(&iface).await);
        let v4_static_ip = answer(self.static_ip_check.has_static_ip(iface_name));
        let v6_other_server = answer(probe::other_server_present_v6(&iface).await);

        ProbeReport {
            v4_other_server,
            v4_static_ip,
            v6_other_server,
        }
    }

    /// Stop, delete the lease database, and fall back to a disabled
    /// configuration that keeps only the work directory and database path.
    async fn reset(&self) -> Result<(), DomainError> {
        self.stop().await;
        let mut state = self.state.lock().await;
        let db_path = state.config.db_path();
        store::remove(&db_path)?;
        state.config = DhcpConfig {
            work_dir: state.config.work_dir.clone(),
            db_file_path: state.config.db_file_path.clone(),
            ..DhcpConfig::default()
        };
        info!(db = %db_path.display(), "DHCP server reset, lease database removed");
        Ok(())
    }
}

fn answer(result: Result<bool, DomainError>) -> OtherServerAnswer {
    match result {
        Ok(true) => OtherServerAnswer::Yes,
        Ok(false) => OtherServerAnswer::No,
        Err(e) => OtherServerAnswer::Error(e.to_string()),
    }
}

/// The lease table doubles as the DNS side's reverse-lookup source. The
/// tables sit behind async mutexes, so this sync port answers best-effort:
/// a momentarily contended lock reads as "no name".
pub struct LeaseNameSource {
    server: Arc<DhcpServer>,
}

impl LeaseNameSource {
    pub fn new(server: Arc<DhcpServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

impl ClientNameSource for LeaseNameSource {
    fn hostname_for_ip(&self, ip: IpAddr) -> Option<String> {
        let state = self.server.state.try_lock().ok()?;
        let running = state.running.as_ref()?;
        match ip {
            IpAddr::V4(_) => {
                let v4 = running.v4.clone()?;
                drop(state);
                v4.try_hostname_for_ip(ip)
            }
            IpAddr::V6(_) => None,
        }
    }
}

/// A do-nothing static-IP capability for platforms without a known
/// configuration surface.
pub struct NoStaticIpInfo;

impl StaticIpCheck for NoStaticIpInfo {
    fn has_static_ip(&self, _iface: &str) -> Result<bool, DomainError> {
        Err(DomainError::IoError(
            "static address detection is not supported on this platform".into(),
        ))
    }
}
