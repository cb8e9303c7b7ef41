//! Longest-prefix-match routing table (§3 "Routing table", §4.3).
//!
//! Entries are kept sorted by descending prefix length; equal-length
//! entries tie-break by ascending prefix value then ascending device id
//! (§9's resolution of the historical source's pointer-dependent ordering).

use std::net::Ipv4Addr;
use std::sync::RwLock;

use crate::device::DeviceId;
use crate::ether::MacAddr;

/// Age-counter sentinels for a routing entry's `metric` field (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Never expires: local or admin-installed.
    NoDel,
    /// Rounds since last refresh.
    Rounds(u32),
    /// Advertised as withdrawn but not yet removed.
    Timeout,
    /// To be removed next cycle.
    Die,
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub prefix: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub dev: DeviceId,
    pub next_hop: MacAddr,
    pub dist: u16,
    pub is_local: bool,
    pub metric: Metric,
}

impl RouteEntry {
    pub fn prefix_len(&self) -> u32 {
        u32::from(self.mask).count_ones()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.mask) == u32::from(self.prefix)
    }
}

/// `8 + 8*count`-bounded advertisement unit used by both the routing table
/// and the SDP wire codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpItem {
    pub prefix: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub dist: u16,
    pub withdraw: bool,
}

pub struct RoutingTable {
    entries: RwLock<Vec<RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    fn sort_key(e: &RouteEntry) -> (std::cmp::Reverse<u32>, u32, DeviceId) {
        (std::cmp::Reverse(e.prefix_len()), u32::from(e.prefix), e.dev)
    }

    /// `lookup(ip)` (§4.3): first entry in descending-prefix order whose
    /// `ip & mask == prefix`.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<RouteEntry> {
        self.entries.read().unwrap().iter().find(|e| e.contains(ip)).cloned()
    }

    pub fn find(&self, prefix: Ipv4Addr, mask: Ipv4Addr) -> Option<RouteEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|e| e.prefix == prefix && e.mask == mask)
            .cloned()
    }

    /// Inserts or replaces the entry for `(prefix, mask)`, keeping the
    /// invariant of at most one entry per (prefix, mask) (§3).
    pub fn set_item(&self, entry: RouteEntry) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|e| !(e.prefix == entry.prefix && e.mask == entry.mask));
        entries.push(entry);
        entries.sort_by_key(Self::sort_key);
    }

    pub fn remove(&self, prefix: Ipv4Addr, mask: Ipv4Addr) {
        self.entries.write().unwrap().retain(|e| !(e.prefix == prefix && e.mask == mask));
    }

    pub fn snapshot(&self) -> Vec<RouteEntry> {
        self.entries.read().unwrap().clone()
    }

    /// Live entries for an outgoing advertisement: excludes `TIMEOUT`/`DIE`
    /// (§4.3 "Periodic loop").
    pub fn live_entries(&self) -> Vec<RouteEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| !matches!(e.metric, Metric::Timeout | Metric::Die))
            .cloned()
            .collect()
    }

    /// Ages every entry in place per §4.3; returns the prefixes that moved
    /// into `Timeout` this cycle (these need a withdrawal broadcast) and the
    /// ones removed outright.
    pub fn age(&self, timeout_rounds: u32) -> (Vec<RouteEntry>, Vec<RouteEntry>) {
        let mut entries = self.entries.write().unwrap();
        let mut newly_timed_out = Vec::new();
        let mut removed = Vec::new();
        entries.retain_mut(|e| match e.metric {
            Metric::NoDel => true,
            Metric::Die => {
                removed.push(e.clone());
                false
            }
            Metric::Timeout => {
                e.metric = Metric::Die;
                newly_timed_out.push(e.clone());
                true
            }
            Metric::Rounds(r) => {
                let next = r + 1;
                e.metric = if next >= timeout_rounds { Metric::Timeout } else { Metric::Rounds(next) };
                true
            }
        });
        (newly_timed_out, removed)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

pub fn mask_for_prefix_len(len: u32) -> Ipv4Addr {
    if len == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - len))
    }
}

pub fn prefix_len_for_mask(mask: Ipv4Addr) -> u8 {
    u32::from(mask).count_ones() as u8
}
