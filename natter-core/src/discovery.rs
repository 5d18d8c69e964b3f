//! Discovery bookkeeping: deduplicated peer registry and scan-cycle control. No I/O; the host
//! runs the actual scan and reports sightings.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::model::{DiscoveredPeer, PeerAddress};

/// Peers not re-sighted for this long are dropped when a scan cycle ends.
pub const DEFAULT_PEER_RETENTION_SECS: i64 = 30;

/// One raw sighting reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub address: PeerAddress,
    pub display_name: String,
    pub bonded: bool,
}

/// Address-keyed record of discovered peers. A later sighting replaces the earlier record.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<PeerAddress, DiscoveredPeer>,
    retention: Duration,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_retention(Duration::seconds(DEFAULT_PEER_RETENTION_SECS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            retention,
        }
    }

    /// Record a sighting. Returns true when the exposed list changed.
    ///
    /// An empty name in the sighting keeps the previously resolved name: radios often
    /// report the address before the name.
    pub fn on_sighting(&mut self, sighting: Sighting, now: DateTime<Utc>) -> bool {
        let previous = self.peers.get(&sighting.address);
        let display_name = match previous {
            Some(p) if sighting.display_name.is_empty() => p.display_name.clone(),
            _ => sighting.display_name,
        };
        let peer = DiscoveredPeer {
            address: sighting.address.clone(),
            display_name,
            bonded: sighting.bonded,
            last_seen_at: now,
        };
        let changed = previous != Some(&peer);
        self.peers.insert(sighting.address, peer);
        changed
    }

    /// Drop peers last seen before `now - retention`. Returns the removed addresses.
    pub fn prune(&mut self, now: DateTime<Utc>) -> Vec<PeerAddress> {
        let cutoff = now - self.retention;
        let stale: Vec<PeerAddress> = self
            .peers
            .values()
            .filter(|p| p.last_seen_at < cutoff)
            .map(|p| p.address.clone())
            .collect();
        for addr in &stale {
            self.peers.remove(addr);
        }
        stale
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&DiscoveredPeer> {
        self.peers.get(address)
    }

    /// Most-recently-seen first; ties broken by address so the order is stable.
    pub fn list(&self) -> Vec<DiscoveredPeer> {
        let mut out: Vec<DiscoveredPeer> = self.peers.values().cloned().collect();
        out.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.address.cmp(&b.address))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Start/stop bookkeeping for timed scan cycles. Each cycle gets an id so late reports from a
/// cancelled cycle can be told apart from the current one.
#[derive(Debug, Default)]
pub struct ScanControl {
    active: Option<u64>,
    next_cycle: u64,
}

impl ScanControl {
    /// Begin a cycle. `None` when one is already running (no-op).
    pub fn start(&mut self) -> Option<u64> {
        if self.active.is_some() {
            return None;
        }
        self.next_cycle += 1;
        self.active = Some(self.next_cycle);
        self.active
    }

    /// Cancel the running cycle, returning its id. `None` when idle (no-op).
    pub fn stop(&mut self) -> Option<u64> {
        self.active.take()
    }

    /// The host reports that `cycle` ended on its own. True if it was the running one.
    pub fn finish(&mut self, cycle: u64) -> bool {
        if self.active == Some(cycle) {
            self.active = None;
            true
        } else {
            false
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    pub fn current(&self) -> Option<u64> {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(addr: &str, name: &str) -> Sighting {
        Sighting {
            address: addr.into(),
            display_name: name.into(),
            bonded: false,
        }
    }

    #[test]
    fn same_address_twice_keeps_one_entry_with_latest_name() {
        let mut reg = PeerRegistry::new();
        let t0 = Utc::now();
        assert!(reg.on_sighting(sighting("AA:BB", "old"), t0));
        assert!(reg.on_sighting(sighting("AA:BB", "new"), t0 + Duration::seconds(1)));
        let list = reg.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].display_name, "new");
    }

    #[test]
    fn empty_name_does_not_clobber_known_name() {
        let mut reg = PeerRegistry::new();
        let t0 = Utc::now();
        reg.on_sighting(sighting("AA:BB", "phone"), t0);
        reg.on_sighting(sighting("AA:BB", ""), t0 + Duration::seconds(1));
        assert_eq!(reg.get(&"AA:BB".into()).unwrap().display_name, "phone");
    }

    #[test]
    fn list_is_most_recently_seen_first() {
        let mut reg = PeerRegistry::new();
        let t0 = Utc::now();
        reg.on_sighting(sighting("AA:01", "a"), t0);
        reg.on_sighting(sighting("AA:02", "b"), t0 + Duration::seconds(1));
        reg.on_sighting(sighting("AA:01", "a"), t0 + Duration::seconds(2));
        let order: Vec<String> = reg.list().into_iter().map(|p| p.address.to_string()).collect();
        assert_eq!(order, vec!["AA:01", "AA:02"]);
    }

    #[test]
    fn prune_drops_peers_past_retention() {
        let mut reg = PeerRegistry::with_retention(Duration::seconds(10));
        let t0 = Utc::now();
        reg.on_sighting(sighting("AA:01", "stale"), t0);
        reg.on_sighting(sighting("AA:02", "fresh"), t0 + Duration::seconds(15));
        let removed = reg.prune(t0 + Duration::seconds(20));
        assert_eq!(removed, vec![PeerAddress::from("AA:01")]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn scan_start_and_stop_are_idempotent() {
        let mut scan = ScanControl::default();
        let first = scan.start();
        assert!(first.is_some());
        assert_eq!(scan.start(), None);
        assert_eq!(scan.stop(), first);
        assert_eq!(scan.stop(), None);
        assert!(!scan.is_scanning());
    }

    #[test]
    fn late_finish_from_cancelled_cycle_ignored() {
        let mut scan = ScanControl::default();
        let old = scan.start().unwrap();
        scan.stop();
        let new = scan.start().unwrap();
        assert!(!scan.finish(old));
        assert!(scan.is_scanning());
        assert!(scan.finish(new));
    }
}
