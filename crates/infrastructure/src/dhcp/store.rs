//! The lease database: a JSON record list, loaded tolerantly at startup and
//! rewritten in full by a single writer task on every change.

use homegate_domain::{DomainError, Lease, MacAddr};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Leases as partitioned by the loader.
#[derive(Debug, Default)]
pub struct LoadedLeases {
    pub v4: Vec<Lease>,
    pub v6: Vec<Lease>,
}

/// Read the lease database. A missing file is an empty table; a corrupt
/// file is logged and treated the same, the next write replaces it.
pub fn load(path: &Path) -> LoadedLeases {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No lease database yet");
            return LoadedLeases::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read lease database");
            return LoadedLeases::default();
        }
    };

    let records: Vec<Lease> = match serde_json::from_str(&text) {
        Ok(records) => records,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt lease database ignored");
            return LoadedLeases::default();
        }
    };

    normalize(records)
}

/// Partition records per family and deduplicate by hardware address with
/// static precedence. IP canonicalization happened during JSON parsing; an
/// IPv4-mapped IPv6 address is folded back to its 4-byte form here.
pub fn normalize(records: Vec<Lease>) -> LoadedLeases {
    let mut by_mac: HashMap<MacAddr, Lease> = HashMap::new();
    for mut lease in records {
        if lease.expiry == 0 {
            // Never committed; the writer should not have stored it.
            continue;
        }
        if let IpAddr::V6(v6) = lease.ip {
            if let Some(v4) = v6.to_ipv4_mapped() {
                lease.ip = IpAddr::V4(v4);
            }
        }
        match by_mac.get(&lease.mac) {
            Some(existing) if existing.is_static() && !lease.is_static() => {}
            _ => {
                by_mac.insert(lease.mac, lease);
            }
        }
    }

    let mut loaded = LoadedLeases::default();
    for lease in by_mac.into_values() {
        match lease.ip {
            IpAddr::V4(_) => loaded.v4.push(lease),
            IpAddr::V6(_) => loaded.v6.push(lease),
        }
    }
    // Deterministic on-disk and reset order.
    loaded.v4.sort_by_key(|l| l.mac);
    loaded.v6.sort_by_key(|l| l.mac);
    loaded
}

/// Serialize and atomically replace the database file.
fn write_snapshot(path: &Path, leases: &[Lease]) -> Result<(), DomainError> {
    let committed: Vec<&Lease> = leases.iter().filter(|l| l.expiry != 0).collect();
    let json = serde_json::to_string_pretty(&committed)
        .map_err(|e| DomainError::IoError(format!("serialize leases: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DomainError::IoError(format!("create {}: {e}", parent.display())))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .map_err(|e| DomainError::IoError(format!("write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| DomainError::IoError(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

/// Handle the servers use to trigger persistence. Sending is cheap and
/// never blocks; snapshots are written in order by one task.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<Vec<Lease>>,
}

impl StoreWriter {
    /// Spawn the writer loop. The returned handle is shared by both
    /// families.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Lease>>();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                let path = path.clone();
                let result =
                    tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Lease database write failed"),
                    Err(e) => warn!(error = %e, "Lease database writer panicked"),
                }
            }
            info!("Lease database writer stopped");
        });
        Self { tx }
    }

    /// Enqueue the full current lease list for persistence.
    pub fn persist(&self, snapshot: Vec<Lease>) {
        let _ = self.tx.send(snapshot);
    }
}

/// Delete the database file; used by `reset`.
pub fn remove(path: &Path) -> Result<(), DomainError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DomainError::IoError(format!(
            "remove {}: {e}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homegate_domain::STATIC_LEASE_EXPIRY;

    fn mac(last: u8) -> MacAddr {
        MacAddr([2, 0, 0, 0, 0, last])
    }

    fn lease(last: u8, ip: &str, expiry: i64) -> Lease {
        Lease {
            mac: mac(last),
            ip: ip.parse().unwrap(),
            hostname: format!("host{last}"),
            expiry,
        }
    }

    #[test]
    fn round_trip_preserves_normalized_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");

        let leases = vec![
            lease(1, "192.168.1.10", 1_700_000_000),
            lease(2, "192.168.1.11", STATIC_LEASE_EXPIRY),
            lease(3, "fd00::5", 1_700_000_000),
        ];
        write_snapshot(&path, &leases).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded.v4.len(), 2);
        assert_eq!(loaded.v6.len(), 1);
        let statics: Vec<_> = loaded.v4.iter().filter(|l| l.is_static()).collect();
        assert_eq!(statics.len(), 1);
        assert_eq!(statics[0].mac, mac(2));
    }

    #[test]
    fn static_precedence_on_duplicate_mac() {
        let loaded = normalize(vec![
            lease(1, "192.168.1.10", 1_700_000_000),
            lease(1, "192.168.1.20", STATIC_LEASE_EXPIRY),
        ]);
        assert_eq!(loaded.v4.len(), 1);
        assert!(loaded.v4[0].is_static());

        // Same outcome regardless of record order.
        let loaded = normalize(vec![
            lease(1, "192.168.1.20", STATIC_LEASE_EXPIRY),
            lease(1, "192.168.1.10", 1_700_000_000),
        ]);
        assert!(loaded.v4[0].is_static());
    }

    #[test]
    fn uncommitted_records_dropped() {
        let loaded = normalize(vec![lease(1, "192.168.1.10", 0)]);
        assert!(loaded.v4.is_empty());
    }

    #[test]
    fn mapped_v6_folds_to_v4() {
        let loaded = normalize(vec![lease(1, "::ffff:192.168.1.10", 1_700_000_000)]);
        assert_eq!(loaded.v4.len(), 1);
        assert_eq!(loaded.v4[0].ip, "192.168.1.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn missing_file_is_empty() {
        let loaded = load(Path::new("/nonexistent/leases.json"));
        assert!(loaded.v4.is_empty() && loaded.v6.is_empty());
    }

    #[test]
    fn corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");
        std::fs::write(&path, "{not json").unwrap();
        let loaded = load(&path);
        assert!(loaded.v4.is_empty());
    }
}
