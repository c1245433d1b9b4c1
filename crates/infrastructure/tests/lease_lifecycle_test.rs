use homegate_application::{LeaseChange, LeaseChangeListener};
use homegate_domain::{Dhcp4Config, Lease, LeaseMask, MacAddr};
use homegate_infrastructure::dhcp::icmp::IcmpProber;
use homegate_infrastructure::dhcp::store;
use homegate_infrastructure::dhcp::v4::Dhcp4Server;
use homegate_infrastructure::system::ifaces::InterfaceInfo;
use std::sync::Arc;

struct Noop;

impl LeaseChangeListener for Noop {
    fn lease_changed(&self, _change: LeaseChange) {}
}

fn iface() -> InterfaceInfo {
    InterfaceInfo {
        name: "eth0".into(),
        index: 2,
        mac: MacAddr([0xde, 0xad, 0xbe, 0xef, 0, 1]),
        ipv4: vec!["10.0.0.1".parse().unwrap()],
        ipv6: vec![],
    }
}

fn conf() -> Dhcp4Config {
    Dhcp4Config {
        gateway_ip: "10.0.0.1".parse().unwrap(),
        subnet_mask: "255.255.255.0".parse().unwrap(),
        range_start: "10.0.0.100".parse().unwrap(),
        range_end: "10.0.0.200".parse().unwrap(),
        lease_duration_secs: 3600,
        icmp_timeout_ms: 0,
        options: vec![],
    }
}

fn server() -> Dhcp4Server {
    Dhcp4Server::new(conf(), iface(), Arc::new(IcmpProber::new()), Arc::new(Noop)).unwrap()
}

fn static_lease(last: u8, ip: &str) -> Lease {
    Lease::new_static(
        MacAddr([0x22, 0, 0, 0, 0, last]),
        ip.parse().unwrap(),
        String::new(),
    )
}

#[tokio::test]
async fn static_lease_visible_until_removed() {
    let server = server();
    let lease = static_lease(1, "10.0.0.50");

    server.add_static_lease(lease.clone()).await.unwrap();
    let statics = server.leases(LeaseMask::Static).await;
    assert_eq!(statics.len(), 1);
    assert_eq!(statics[0].mac, lease.mac);
    assert_eq!(statics[0].ip, lease.ip);

    // A second add under the same key is a conflict, not a duplicate.
    assert!(server.add_static_lease(lease.clone()).await.is_err());
    assert_eq!(server.leases(LeaseMask::Static).await.len(), 1);

    server.remove_static_lease(lease).await.unwrap();
    assert!(server.leases(LeaseMask::Static).await.is_empty());
}

#[tokio::test]
async fn static_lease_outside_subnet_rejected() {
    let server = server();
    let err = server
        .add_static_lease(static_lease(1, "192.168.77.5"))
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn reset_skips_out_of_range_dynamics_but_keeps_subnet_statics() {
    let server = server();
    let in_range = Lease {
        mac: MacAddr([2, 0, 0, 0, 0, 1]),
        ip: "10.0.0.150".parse().unwrap(),
        hostname: "laptop".into(),
        expiry: i64::MAX - 1,
    };
    let out_of_range = Lease {
        mac: MacAddr([2, 0, 0, 0, 0, 2]),
        ip: "192.168.1.5".parse().unwrap(),
        hostname: String::new(),
        expiry: i64::MAX - 1,
    };
    // Static below the pool but inside the subnet.
    let static_outside_pool = static_lease(3, "10.0.0.5");

    server
        .reset_leases(vec![in_range.clone(), out_of_range, static_outside_pool.clone()])
        .await;

    let all = server.leases(LeaseMask::All).await;
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|l| l.ip == in_range.ip));
    assert!(all.iter().any(|l| l.ip == static_outside_pool.ip));
}

#[tokio::test]
async fn store_round_trip_feeds_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leases.json");

    let writer = store::StoreWriter::spawn(path.clone());
    writer.persist(vec![
        Lease {
            mac: MacAddr([2, 0, 0, 0, 0, 1]),
            ip: "10.0.0.150".parse().unwrap(),
            hostname: "laptop".into(),
            expiry: i64::MAX - 1,
        },
        static_lease(9, "10.0.0.50"),
    ]);

    // The writer is asynchronous; wait for the snapshot to land.
    for _ in 0..100 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let loaded = store::load(&path);
    assert_eq!(loaded.v4.len(), 2);

    let server = server();
    server.reset_leases(loaded.v4).await;
    assert_eq!(server.leases(LeaseMask::All).await.len(), 2);
    assert_eq!(server.leases(LeaseMask::Static).await.len(), 1);
}
