#![allow(dead_code)] // not every test binary uses every helper

use std::collections::HashMap;

use sdht_coord::{distance_cmp, xor_distance, NodeId};

/// Node id whose distance to the all-zero target is exactly `n`.
///
/// Handy for tests that want a readable distance ordering.
pub fn near_id(n: u8) -> NodeId {
    let mut id = [0u8; 32];
    id[31] = n;
    id
}

/// In-memory overlay standing in for the remote side of the transport.
///
/// Each registered node knows a set of peers and answers closest-node
/// requests from that knowledge, the way a remote routing table would.
#[derive(Default)]
pub struct SimOverlay {
    known: HashMap<NodeId, Vec<NodeId>>,
    k: usize,
}

impl SimOverlay {
    pub fn new(k: usize) -> Self {
        Self {
            known: HashMap::new(),
            k,
        }
    }

    pub fn add_node(&mut self, id: NodeId, peers: Vec<NodeId>) {
        self.known.insert(id, peers);
    }

    /// The node's answer to "who is closer to `target`": its k known peers
    /// with the smallest XOR distance.
    pub fn closer_nodes(&self, node: &NodeId, target: &NodeId) -> Vec<NodeId> {
        let Some(peers) = self.known.get(node) else {
            return Vec::new();
        };
        let mut sorted = peers.clone();
        sorted.sort_by(|a, b| distance_cmp(&xor_distance(a, target), &xor_distance(b, target)));
        sorted.truncate(self.k);
        sorted
    }

    /// Ground truth: the k registered nodes closest to `target`.
    pub fn global_closest(&self, target: &NodeId) -> Vec<NodeId> {
        let mut all: Vec<NodeId> = self.known.keys().copied().collect();
        all.sort_by(|a, b| distance_cmp(&xor_distance(a, target), &xor_distance(b, target)));
        all.truncate(self.k);
        all
    }
}
