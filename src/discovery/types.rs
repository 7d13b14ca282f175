use crate::catalogue::types::int_string;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Busy,
    Idle,
}

impl NodeStatus {
    pub fn from_busy(busy: bool) -> Self {
        if busy { NodeStatus::Busy } else { NodeStatus::Idle }
    }
}

/// A node that offers CPU capacity, as last announced.
///
/// Records are keyed by `address`: a later announcement from the same address
/// replaces the earlier one wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: IpAddr,
    pub host: String,
    pub system: String,
    pub cores: usize,
    pub status: NodeStatus,
    /// Seconds for the standard benchmark job; lower is faster.
    pub performance_index: Option<f64>,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl NodeRecord {
    pub fn is_busy(&self) -> bool {
        self.status == NodeStatus::Busy
    }
}

/// The multicast datagram a sharing node sends every announce interval.
///
/// Core count and performance index travel as strings for compatibility with
/// older nodes; both are parsed and checked in `into_record`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Announcement {
    pub magic: String,
    pub address: String,
    pub host: String,
    pub system: String,
    #[serde(with = "int_string")]
    pub cores: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_index: Option<String>,
    pub status: NodeStatus,
}

impl Announcement {
    pub fn new(magic: &str, node: &NodeRecord) -> Self {
        Self {
            magic: magic.to_string(),
            address: node.address.to_string(),
            host: node.host.clone(),
            system: node.system.clone(),
            cores: node.cores as u64,
            performance_index: node.performance_index.map(|index| index.to_string()),
            status: node.status,
        }
    }

    /// Validates the datagram. `None` for a foreign magic, zero cores or an
    /// unparseable address; such datagrams are dropped without comment.
    pub fn into_record(self, magic: &str, now: Instant) -> Option<NodeRecord> {
        if self.magic != magic || self.cores == 0 {
            return None;
        }
        let address: IpAddr = self.address.trim().parse().ok()?;

        let performance_index = self
            .performance_index
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|index| index.is_finite() && *index > 0.0);

        Some(NodeRecord {
            address,
            host: self.host,
            system: self.system,
            cores: self.cores as usize,
            status: self.status,
            performance_index,
            last_seen: Some(now),
        })
    }
}
