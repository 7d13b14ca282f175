use super::types::NodeRecord;

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Live set of announced nodes, shared by the listener, the expiry sweep and
/// the coordinator.
#[derive(Debug, Default)]
pub struct NodeRoster {
    nodes: DashMap<IpAddr, NodeRecord>,
}

impl NodeRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for its address. Returns `true` when the
    /// address was not known before.
    pub fn upsert(&self, mut record: NodeRecord) -> bool {
        if record.last_seen.is_none() {
            record.last_seen = Some(Instant::now());
        }
        self.nodes.insert(record.address, record).is_none()
    }

    /// Drops every record not seen for `threshold` or longer and returns their
    /// addresses.
    pub fn expire(&self, now: Instant, threshold: Duration) -> Vec<IpAddr> {
        let stale: Vec<IpAddr> = self
            .nodes
            .iter()
            .filter(|entry| match entry.value().last_seen {
                Some(seen) => now.saturating_duration_since(seen) >= threshold,
                None => false,
            })
            .map(|entry| *entry.key())
            .collect();

        for address in &stale {
            self.nodes.remove(address);
        }
        stale
    }

    /// Copy of the roster ordered by address, so dispatch order is stable.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> =
            self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by_key(|node| node.address);
        nodes
    }

    pub fn get(&self, address: &IpAddr) -> Option<NodeRecord> {
        self.nodes.get(address).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
