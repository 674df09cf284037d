//! DHT routing table
//!
//! Kademlia buckets indexed by the length of the prefix a node shares with
//! our own id. A full bucket only admits a newcomer by evicting a stale node.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::dht::node::{NodeId, NodeSession};

/// Default nodes per bucket
pub const DEFAULT_BUCKET_SIZE: usize = 8;

const ID_BITS: usize = 160;

/// Outcome of offering a node to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Added,
    Updated,
    /// A stale node was evicted to make room
    Replaced,
    /// Bucket full of good nodes; newcomer dropped
    Dropped,
    /// Our own id is never stored
    Ignored,
}

#[derive(Debug, Clone)]
struct Bucket {
    nodes: Vec<NodeSession>,
    last_changed: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            last_changed: Instant::now(),
        }
    }
}

/// Routing table for one engine instance
#[derive(Debug)]
pub struct NodeTable {
    own_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Bucket>,
}

impl NodeTable {
    pub fn new(own_id: NodeId, bucket_size: usize) -> Self {
        Self {
            own_id,
            bucket_size: bucket_size.max(1),
            buckets: (0..ID_BITS).map(|_| Bucket::new()).collect(),
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    /// Index of the first bit where `id` differs from our id
    fn bucket_index(&self, id: &NodeId) -> usize {
        let distance = self.own_id.distance(id);
        for (byte_index, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                return byte_index * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS - 1
    }

    /// Offer a node that just talked to us
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr) -> InsertResult {
        if id == self.own_id {
            return InsertResult::Ignored;
        }
        let index = self.bucket_index(&id);
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets[index];

        if let Some(node) = bucket.nodes.iter_mut().find(|n| n.id == id) {
            node.addr = addr;
            node.touch();
            bucket.last_changed = Instant::now();
            return InsertResult::Updated;
        }

        if bucket.nodes.len() < bucket_size {
            trace!("Adding node {} to bucket {}", id, index);
            bucket.nodes.push(NodeSession::new(id, addr));
            bucket.last_changed = Instant::now();
            return InsertResult::Added;
        }

        let worst = bucket
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_stale())
            .max_by_key(|(_, n)| (n.failures, n.last_seen.elapsed()))
            .map(|(i, _)| i);
        match worst {
            Some(i) => {
                debug!("Evicting stale node {} from bucket {}", bucket.nodes[i].id, index);
                bucket.nodes[i] = NodeSession::new(id, addr);
                bucket.last_changed = Instant::now();
                InsertResult::Replaced
            }
            None => InsertResult::Dropped,
        }
    }

    /// Refresh a node on any message from it
    pub fn touch(&mut self, id: &NodeId) -> bool {
        let index = self.bucket_index(id);
        match self.buckets[index].nodes.iter_mut().find(|n| &n.id == id) {
            Some(node) => {
                node.touch();
                true
            }
            None => false,
        }
    }

    /// Count a query timeout against a node
    pub fn mark_failed(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        if let Some(node) = self.buckets[index].nodes.iter_mut().find(|n| &n.id == id) {
            node.failures += 1;
            trace!("Node {} failed {} queries", id, node.failures);
        }
    }

    /// Record a timeout for whatever node answers at `addr`
    pub fn mark_failed_addr(&mut self, addr: &SocketAddr) {
        for bucket in &mut self.buckets {
            if let Some(node) = bucket.nodes.iter_mut().find(|n| &n.addr == addr) {
                node.failures += 1;
                return;
            }
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        let before = bucket.nodes.len();
        bucket.nodes.retain(|n| &n.id != id);
        before != bucket.nodes.len()
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeSession> {
        self.buckets[self.bucket_index(id)].nodes.iter().find(|n| &n.id == id)
    }

    /// Up to `count` non-stale nodes ordered by XOR distance to `target`
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeSession> {
        let mut nodes: Vec<&NodeSession> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| !n.is_stale())
            .collect();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.into_iter().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Indices of non-empty buckets untouched for `timeout`
    pub fn stale_buckets(&self, timeout: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.nodes.is_empty() && b.last_changed.elapsed() > timeout)
            .map(|(i, _)| i)
            .collect()
    }

    /// Random id that falls into bucket `index`, for refresh lookups
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let mut id = NodeId::random().0;
        let own = self.own_id.0;
        for bit in 0..=index.min(ID_BITS - 1) {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            let own_bit = own[byte] & mask;
            let want = if bit == index { own_bit ^ mask } else { own_bit };
            id[byte] = (id[byte] & !mask) | want;
        }
        NodeId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn id_with_first(byte: u8, tail: u8) -> NodeId {
        let mut id = [tail; 20];
        id[0] = byte;
        NodeId(id)
    }

    #[test]
    fn test_bucket_index_by_shared_prefix() {
        let table = NodeTable::new(NodeId([0u8; 20]), 8);
        assert_eq!(table.bucket_index(&id_with_first(0x80, 0)), 0);
        assert_eq!(table.bucket_index(&id_with_first(0x01, 0)), 7);
        assert_eq!(table.bucket_index(&NodeId([0u8; 20])), 159);
    }

    #[test]
    fn test_insert_update_and_ignore_self() {
        let mut table = NodeTable::new(NodeId([0u8; 20]), 8);
        assert_eq!(table.insert(NodeId([0u8; 20]), addr(1)), InsertResult::Ignored);
        assert_eq!(table.insert(id_with_first(0x80, 1), addr(2)), InsertResult::Added);
        assert_eq!(table.insert(id_with_first(0x80, 1), addr(3)), InsertResult::Updated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id_with_first(0x80, 1)).unwrap().addr, addr(3));
    }

    #[test]
    fn test_full_bucket_drops_newcomer_unless_stale() {
        let mut table = NodeTable::new(NodeId([0u8; 20]), 2);
        table.insert(id_with_first(0x80, 1), addr(1));
        table.insert(id_with_first(0x80, 2), addr(2));
        assert_eq!(table.insert(id_with_first(0x80, 3), addr(3)), InsertResult::Dropped);

        table.mark_failed(&id_with_first(0x80, 2));
        table.mark_failed(&id_with_first(0x80, 2));
        assert_eq!(table.insert(id_with_first(0x80, 3), addr(3)), InsertResult::Replaced);
        assert!(table.get(&id_with_first(0x80, 2)).is_none());
        assert!(table.get(&id_with_first(0x80, 3)).is_some());
    }

    #[test]
    fn test_touch_clears_failures() {
        let mut table = NodeTable::new(NodeId([0u8; 20]), 8);
        let id = id_with_first(0x40, 9);
        table.insert(id, addr(1));
        table.mark_failed(&id);
        table.mark_failed(&id);
        assert!(table.closest(&id, 8).is_empty());
        assert!(table.touch(&id));
        assert_eq!(table.closest(&id, 8).len(), 1);
    }

    #[test]
    fn test_closest_orders_by_xor() {
        let mut table = NodeTable::new(NodeId([0u8; 20]), 8);
        for first in [0x01u8, 0x10, 0x80, 0xf0] {
            table.insert(id_with_first(first, 0), addr(first as u16));
        }
        let target = id_with_first(0xf1, 0);
        let closest: Vec<u8> = table.closest(&target, 2).iter().map(|n| n.id.0[0]).collect();
        assert_eq!(closest, vec![0xf0, 0x80]);
    }

    #[test]
    fn test_random_id_lands_in_bucket() {
        let table = NodeTable::new(NodeId::random(), 8);
        for index in [0usize, 5, 77, 159] {
            let id = table.random_id_in_bucket(index);
            assert_eq!(table.bucket_index(&id), index.min(159));
        }
    }
}
