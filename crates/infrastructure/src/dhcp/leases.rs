use homegate_domain::{DomainError, Lease, LeaseMask, MacAddr};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One family's lease list. Uniqueness of hardware address and IP is
/// enforced here; the owning server serializes access with its mutex.
#[derive(Default)]
pub struct LeaseTable {
    leases: Vec<Lease>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_by_mac(&self, mac: MacAddr) -> Option<&Lease> {
        self.leases.iter().find(|l| l.mac == mac)
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Option<&Lease> {
        self.leases.iter().find(|l| l.ip == ip)
    }

    pub fn leases(&self, mask: LeaseMask) -> Vec<Lease> {
        self.leases
            .iter()
            .filter(|l| l.matches_mask(mask))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Insert or renew a dynamic lease. An existing lease under the same
    /// hardware address is replaced; the IP must not belong to another
    /// client.
    pub fn commit_dynamic(&mut self, lease: Lease) -> Result<(), DomainError> {
        if let Some(owner) = self.find_by_ip(lease.ip) {
            if owner.mac != lease.mac {
                return Err(DomainError::InvalidIpAddress(format!(
                    "{} already leased to {}",
                    lease.ip, owner.mac
                )));
            }
        }
        self.leases.retain(|l| l.mac != lease.mac);
        self.leases.push(lease);
        Ok(())
    }

    /// Add a static lease. Conflicts with an existing static lease are an
    /// error; a dynamic lease under the same MAC or IP is displaced.
    pub fn add_static(&mut self, lease: Lease) -> Result<(), DomainError> {
        lease.validate()?;
        let clash = self
            .leases
            .iter()
            .any(|l| l.is_static() && (l.mac == lease.mac || l.ip == lease.ip));
        if clash {
            return Err(DomainError::StaticLeaseExists);
        }
        self.leases
            .retain(|l| l.mac != lease.mac && l.ip != lease.ip);
        self.leases.push(Lease {
            expiry: homegate_domain::STATIC_LEASE_EXPIRY,
            ..lease
        });
        Ok(())
    }

    /// Remove a static lease matching both key fields.
    pub fn remove_static(&mut self, lease: &Lease) -> Result<(), DomainError> {
        lease.validate()?;
        let before = self.leases.len();
        self.leases
            .retain(|l| !(l.is_static() && l.mac == lease.mac && l.ip == lease.ip));
        if self.leases.len() == before {
            return Err(DomainError::LeaseNotFound);
        }
        Ok(())
    }

    /// The oldest expired dynamic lease, for recycling when the pool is
    /// exhausted. Blacklisted candidates (zero MAC) qualify once expired;
    /// in-flight offer reservations (`expiry == 0`) never do.
    pub fn oldest_expired(&self, now: i64) -> Option<&Lease> {
        self.leases
            .iter()
            .filter(|l| l.expiry != 0 && l.is_expired(now))
            .min_by_key(|l| l.expiry)
    }

    /// Park a conflict-probed address under the zero MAC until `expiry`.
    /// Placeholders are keyed by IP only, so several may coexist; clients
    /// never match them because a zero CHAddr is dropped at the door.
    pub fn park_blacklisted(&mut self, ip: IpAddr, expiry: i64) {
        if self.find_by_ip(ip).is_none() {
            self.leases.push(Lease {
                mac: MacAddr::ZERO,
                ip,
                hostname: String::new(),
                expiry,
            });
        }
    }

    pub fn remove_by_ip(&mut self, ip: IpAddr) -> Option<Lease> {
        let idx = self.leases.iter().position(|l| l.ip == ip)?;
        Some(self.leases.swap_remove(idx))
    }

    /// Replace the whole table, keeping only leases accepted by
    /// `in_range`. Used by the store loader and by `reset`.
    pub fn reset<F>(&mut self, leases: Vec<Lease>, in_range: F) -> usize
    where
        F: Fn(&Lease) -> bool,
    {
        self.leases.clear();
        let mut skipped = 0usize;
        for lease in leases {
            if !in_range(&lease) {
                skipped += 1;
                continue;
            }
            // Loader input is already deduplicated; keep the guard anyway.
            if self.find_by_mac(lease.mac).is_some() || self.find_by_ip(lease.ip).is_some() {
                skipped += 1;
                continue;
            }
            self.leases.push(lease);
        }
        skipped
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.leases.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homegate_domain::STATIC_LEASE_EXPIRY;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0xaa, 0, 0, 0, 0, last])
    }

    fn lease(last: u8, ip: &str, expiry: i64) -> Lease {
        Lease {
            mac: mac(last),
            ip: ip.parse().unwrap(),
            hostname: String::new(),
            expiry,
        }
    }

    #[test]
    fn commit_replaces_same_mac() {
        let mut table = LeaseTable::new();
        table.commit_dynamic(lease(1, "10.0.0.5", 100)).unwrap();
        table.commit_dynamic(lease(1, "10.0.0.6", 200)).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.find_by_mac(mac(1)).unwrap().expiry, 200);
    }

    #[test]
    fn commit_rejects_foreign_ip() {
        let mut table = LeaseTable::new();
        table.commit_dynamic(lease(1, "10.0.0.5", 100)).unwrap();
        assert!(table.commit_dynamic(lease(2, "10.0.0.5", 100)).is_err());
    }

    #[test]
    fn static_conflict_detected() {
        let mut table = LeaseTable::new();
        table
            .add_static(lease(1, "10.0.0.50", STATIC_LEASE_EXPIRY))
            .unwrap();
        assert!(matches!(
            table.add_static(lease(1, "10.0.0.51", STATIC_LEASE_EXPIRY)),
            Err(DomainError::StaticLeaseExists)
        ));
        assert!(matches!(
            table.add_static(lease(2, "10.0.0.50", STATIC_LEASE_EXPIRY)),
            Err(DomainError::StaticLeaseExists)
        ));
    }

    #[test]
    fn static_displaces_dynamic() {
        let mut table = LeaseTable::new();
        table.commit_dynamic(lease(1, "10.0.0.5", 100)).unwrap();
        table
            .add_static(lease(1, "10.0.0.99", STATIC_LEASE_EXPIRY))
            .unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.find_by_mac(mac(1)).unwrap().is_static());
    }

    #[test]
    fn remove_static_requires_exact_key() {
        let mut table = LeaseTable::new();
        table
            .add_static(lease(1, "10.0.0.50", STATIC_LEASE_EXPIRY))
            .unwrap();
        assert!(matches!(
            table.remove_static(&lease(1, "10.0.0.51", STATIC_LEASE_EXPIRY)),
            Err(DomainError::LeaseNotFound)
        ));
        table
            .remove_static(&lease(1, "10.0.0.50", STATIC_LEASE_EXPIRY))
            .unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn oldest_expired_picks_minimum() {
        let mut table = LeaseTable::new();
        table.commit_dynamic(lease(1, "10.0.0.5", 50)).unwrap();
        table.commit_dynamic(lease(2, "10.0.0.6", 30)).unwrap();
        table.commit_dynamic(lease(3, "10.0.0.7", 900)).unwrap();
        let oldest = table.oldest_expired(100).unwrap();
        assert_eq!(oldest.mac, mac(2));
    }

    #[test]
    fn statics_never_expire() {
        let mut table = LeaseTable::new();
        table
            .add_static(lease(1, "10.0.0.50", STATIC_LEASE_EXPIRY))
            .unwrap();
        assert!(table.oldest_expired(i64::MAX - 1).is_none());
    }

    #[test]
    fn reset_filters_out_of_range() {
        let mut table = LeaseTable::new();
        let skipped = table.reset(
            vec![lease(1, "10.0.0.5", 100), lease(2, "192.168.9.9", 100)],
            |l| match l.ip {
                IpAddr::V4(v4) => v4.octets()[0] == 10,
                IpAddr::V6(_) => false,
            },
        );
        assert_eq!(skipped, 1);
        assert_eq!(table.len(), 1);
    }
}
