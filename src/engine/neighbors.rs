//! Neighbors seen on the bridge (IP to MAC mapping)

use crate::net::MacAddr;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Result of reporting a neighbor sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting of this IP
    New,
    /// Known IP, different MAC
    Moved { previous: MacAddr },
    /// Known IP and MAC
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Neighbors for which host routes were installed
#[derive(Debug, Default)]
pub struct NeighborTable {
    entries: BTreeMap<Ipv4Addr, NeighborEntry>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a sighting without recording it
    pub fn classify(&self, ip: Ipv4Addr, mac: MacAddr) -> Observation {
        match self.entries.get(&ip) {
            None => Observation::New,
            Some(entry) if entry.mac == mac => Observation::Unchanged,
            Some(entry) => Observation::Moved {
                previous: entry.mac,
            },
        }
    }

    /// Insert or update an entry
    pub fn record(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        let now = Utc::now();
        self.entries
            .entry(ip)
            .and_modify(|entry| {
                entry.mac = mac;
                entry.last_seen = now;
            })
            .or_insert(NeighborEntry {
                ip,
                mac,
                first_seen: now,
                last_seen: now,
            });
    }

    /// Refresh the last-seen time of a known entry
    pub fn touch(&mut self, ip: Ipv4Addr) {
        if let Some(entry) = self.entries.get_mut(&ip) {
            entry.last_seen = Utc::now();
        }
    }

    pub fn lookup(&self, ip: &Ipv4Addr) -> Option<MacAddr> {
        self.entries.get(ip).map(|e| e.mac)
    }

    /// Entries ordered by IP
    pub fn entries(&self) -> Vec<NeighborEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let mut table = NeighborTable::new();
        let ip = Ipv4Addr::new(192, 168, 1, 1);
        let mac = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

        assert_eq!(table.classify(ip, mac), Observation::New);
        table.record(ip, mac);
        assert_eq!(table.lookup(&ip), Some(mac));
        assert_eq!(table.classify(ip, mac), Observation::Unchanged);

        let other = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x66]);
        assert_eq!(
            table.classify(ip, other),
            Observation::Moved { previous: mac }
        );
        table.record(ip, other);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(&ip), Some(other));
    }

    #[test]
    fn test_entries_sorted_by_ip() {
        let mut table = NeighborTable::new();
        table.record(Ipv4Addr::new(10, 0, 0, 9), MacAddr([2, 0, 0, 0, 0, 9]));
        table.record(Ipv4Addr::new(10, 0, 0, 2), MacAddr([2, 0, 0, 0, 0, 2]));
        let ips: Vec<_> = table.entries().iter().map(|e| e.ip).collect();
        assert_eq!(ips, vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 9)]);
    }

    #[test]
    fn test_touch_keeps_first_seen() {
        let mut table = NeighborTable::new();
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        table.record(ip, MacAddr([2, 0, 0, 0, 0, 2]));
        let before = table.entries()[0].clone();
        table.touch(ip);
        let after = &table.entries()[0];
        assert_eq!(after.first_seen, before.first_seen);
        assert!(after.last_seen >= before.last_seen);
    }
}
