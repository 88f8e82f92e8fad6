use crate::compact::CompactNodeInfo;
use crate::id::NodeId;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Congestion never shrinks the neighbour cap below this.
pub const MIN_NEIGHBOURS: usize = 200;

/// Neighbours learned since the last tick. Emptied every tick; nodes are not
/// kept around once they have been queried.
#[derive(Debug, Default)]
pub struct RoutingTable {
    nodes: HashMap<NodeId, SocketAddrV4>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts `node` unless it advertises port 0 or the table already holds
    /// `max` entries. A node id seen twice keeps the latest address.
    pub fn insert_bounded(&mut self, node: &CompactNodeInfo, max: usize) -> bool {
        if node.addr.port() == 0 || self.nodes.len() >= max {
            return false;
        }
        self.nodes.insert(node.id, node.addr);
        true
    }

    /// Takes every entry, leaving the table empty for the next tick.
    pub fn drain(&mut self) -> HashMap<NodeId, SocketAddrV4> {
        std::mem::take(&mut self.nodes)
    }
}

/// Upper bound on the routing table size: shrinks by 10% on congestion and
/// recovers by 1% per tick, never above the configured value.
#[derive(Debug)]
pub struct NeighbourBudget {
    current: AtomicUsize,
    ceiling: usize,
}

impl NeighbourBudget {
    pub fn new(initial: usize) -> Self {
        Self {
            current: AtomicUsize::new(initial),
            ceiling: initial,
        }
    }

    pub fn get(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn on_congestion(&self) {
        let shrunk = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                (cur > MIN_NEIGHBOURS).then(|| (cur / 10 * 9 + cur % 10 * 9 / 10).max(MIN_NEIGHBOURS))
            });
        match shrunk {
            Ok(prev) => {
                tracing::debug!(from = prev, to = self.get(), "routing: max neighbours reduced");
            }
            Err(cur) => {
                tracing::warn!(
                    max_neighbours = cur,
                    "routing: still congested at the neighbour floor (check your network connection if this recurs)"
                );
            }
        }
    }

    pub fn grow(&self) {
        let ceiling = self.ceiling;
        let _ = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                (cur < ceiling).then(|| cur.saturating_add((cur / 100).max(1)).min(ceiling))
            });
    }
}
