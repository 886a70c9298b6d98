//! Peer directory
//!
//! Advisory map from peer address to the identity it last announced. Filled
//! by the discovery listener, swept by the reaper, and read when labelling
//! incoming calls or resolving dial targets.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Last-known identity of a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: IpAddr,
    pub signaling_port: u16,
    pub display_name: String,
    pub role: String,
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn signaling_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.signaling_port)
    }
}

/// Result of [`PeerDirectory::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New peer, or its signaling port moved; worth probing
    Changed,
    /// Known peer re-announced itself
    Refreshed,
}

/// Address-keyed peer map behind one lock
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: Mutex<HashMap<IpAddr, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announcement from `address`
    pub fn upsert(
        &self,
        address: IpAddr,
        signaling_port: u16,
        display_name: &str,
        role: &str,
        now: Instant,
    ) -> UpsertOutcome {
        let mut peers = self.peers.lock();
        match peers.get_mut(&address) {
            Some(record) if record.signaling_port == signaling_port => {
                record.last_seen = now;
                if record.display_name != display_name {
                    record.display_name = display_name.to_string();
                }
                if record.role != role {
                    record.role = role.to_string();
                }
                UpsertOutcome::Refreshed
            }
            _ => {
                peers.insert(
                    address,
                    PeerRecord {
                        address,
                        signaling_port,
                        display_name: display_name.to_string(),
                        role: role.to_string(),
                        last_seen: now,
                    },
                );
                UpsertOutcome::Changed
            }
        }
    }

    /// Drop every peer not seen within `ttl` of `now`.
    ///
    /// Returns whether anything was removed.
    pub fn evict_stale(&self, now: Instant, ttl: Duration) -> bool {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|_, record| now.saturating_duration_since(record.last_seen) <= ttl);
        peers.len() != before
    }

    pub fn lookup(&self, address: &IpAddr) -> Option<PeerRecord> {
        self.peers.lock().get(address).cloned()
    }

    /// Display name for `address`, if known
    pub fn display_name(&self, address: &IpAddr) -> Option<String> {
        self.peers.lock().get(address).map(|r| r.display_name.clone())
    }

    /// All peers, ordered by display name then address
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<_> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.address.cmp(&b.address))
        });
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_upsert_new_peer_is_changed() {
        let dir = PeerDirectory::new();
        let now = Instant::now();

        assert_eq!(dir.upsert(ip("10.0.0.5"), 5060, "Alice", "Buyer", now), UpsertOutcome::Changed);

        let record = dir.lookup(&ip("10.0.0.5")).unwrap();
        assert_eq!(record.signaling_port, 5060);
        assert_eq!(record.display_name, "Alice");
        assert_eq!(record.role, "Buyer");
    }

    #[test]
    fn test_upsert_same_port_refreshes() {
        let dir = PeerDirectory::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(3);

        dir.upsert(ip("10.0.0.5"), 5060, "Alice", "Buyer", t0);
        assert_eq!(dir.upsert(ip("10.0.0.5"), 5060, "Alice", "Seller", t1), UpsertOutcome::Refreshed);

        let record = dir.lookup(&ip("10.0.0.5")).unwrap();
        assert_eq!(record.last_seen, t1);
        assert_eq!(record.role, "Seller");
    }

    #[test]
    fn test_upsert_port_change_is_changed() {
        let dir = PeerDirectory::new();
        let now = Instant::now();

        dir.upsert(ip("10.0.0.5"), 5060, "Alice", "Buyer", now);
        assert_eq!(dir.upsert(ip("10.0.0.5"), 5070, "Alice", "Buyer", now), UpsertOutcome::Changed);
        assert_eq!(dir.lookup(&ip("10.0.0.5")).unwrap().signaling_port, 5070);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_stale_peer_evicted_after_ttl() {
        let dir = PeerDirectory::new();
        let ttl = Duration::from_secs(12);
        let t0 = Instant::now();

        dir.upsert(ip("10.0.0.5"), 5060, "Alice", "Buyer", t0);
        assert!(!dir.evict_stale(t0 + Duration::from_secs(12), ttl));
        assert!(dir.evict_stale(t0 + Duration::from_secs(13), ttl));
        assert!(dir.lookup(&ip("10.0.0.5")).is_none());
        assert!(!dir.evict_stale(t0 + Duration::from_secs(20), ttl));
    }

    #[test]
    fn test_refreshed_peer_never_evicted() {
        let dir = PeerDirectory::new();
        let ttl = Duration::from_secs(12);
        let t0 = Instant::now();

        for tick in 0..20u64 {
            let now = t0 + Duration::from_secs(tick * 3);
            dir.upsert(ip("10.0.0.5"), 5060, "Alice", "Buyer", now);
            assert!(!dir.evict_stale(now + Duration::from_secs(2), ttl));
        }
        assert!(dir.lookup(&ip("10.0.0.5")).is_some());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let dir = PeerDirectory::new();
        let now = Instant::now();
        dir.upsert(ip("10.0.0.9"), 5060, "Zed", "Seller", now);
        dir.upsert(ip("10.0.0.5"), 5060, "Alice", "Buyer", now);

        let names: Vec<_> = dir.snapshot().into_iter().map(|p| p.display_name).collect();
        assert_eq!(names, vec!["Alice", "Zed"]);
        assert_eq!(dir.display_name(&ip("10.0.0.9")).as_deref(), Some("Zed"));
        assert_eq!(dir.display_name(&ip("10.0.0.1")), None);
    }
}
