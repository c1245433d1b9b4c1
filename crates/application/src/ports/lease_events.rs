use homegate_domain::Lease;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseChangeKind {
    /// A lease was added or renewed.
    Committed,
    /// A lease was removed.
    Removed,
    /// The whole table was replaced (startup load, reset).
    TableReplaced,
}

#[derive(Debug, Clone)]
pub struct LeaseChange {
    pub kind: LeaseChangeKind,
    /// The affected lease; `None` for `TableReplaced`.
    pub lease: Option<Lease>,
}

/// Receives lease-table changes in insertion order, per address family.
///
/// The lease store subscribes to persist snapshots; the DNS side subscribes
/// to keep client-hostname answers fresh.
pub trait LeaseChangeListener: Send + Sync {
    fn lease_changed(&self, change: LeaseChange);
}
