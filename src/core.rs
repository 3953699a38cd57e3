//! Fundamental identity and measurement types shared by every layer of the
//! coordination core.
//!
//! - **Identity & Hashing**: [`NodeId`], [`Key`], [`derive_node_id`],
//!   [`key_for_content`]
//! - **Distance Metrics**: [`xor_distance`], [`distance_cmp`] for
//!   Kademlia-style ordering
//! - **Bookkeeping**: [`QueryId`] to address a running query and
//!   [`QueryStats`] to summarise its request history

use std::fmt;

use iroh_blake3::Hasher;

// ============================================================================
// Type Aliases
// ============================================================================

/// A 256-bit identifier for DHT nodes.
///
/// Node IDs are derived from the node's public key using BLAKE3 hashing,
/// ensuring a uniform distribution across the identifier space.
pub type NodeId = [u8; 32];

/// A 256-bit key identifying a lookup target or stored record.
///
/// Keys live in the same identifier space as node IDs, so the XOR distance
/// between a key and a node ID is well defined.
pub type Key = [u8; 32];

// ============================================================================
// Hashing Functions
// ============================================================================

/// Compute a 32-byte BLAKE3 digest of the input data.
fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable 32-byte [`NodeId`] by hashing arbitrary input with BLAKE3.
///
/// Typically used to derive a node's DHT identity from its public key:
///
/// ```
/// use sdht_coord::derive_node_id;
///
/// let public_key = b"example-public-key-bytes";
/// let node_id = derive_node_id(public_key);
/// assert_eq!(node_id.len(), 32);
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    blake3_digest(data)
}

/// Compute a lookup [`Key`] as the BLAKE3 hash of content bytes.
///
/// Records published through a follow-up broadcast are addressed by the
/// hash of their content:
///
/// ```
/// use sdht_coord::key_for_content;
///
/// let content = b"hello world";
/// let key = key_for_content(content);
/// // The same content always produces the same key
/// assert_eq!(key, key_for_content(content));
/// ```
pub fn key_for_content(data: &[u8]) -> Key {
    blake3_digest(data)
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Compute the XOR distance between two 256-bit identifiers.
///
/// XOR distance is the foundation of Kademlia routing. Identifiers that are
/// "closer" in XOR space share more leading bits in common.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]` (reflexive)
/// - `xor_distance(a, b) == xor_distance(b, a)` (symmetric)
/// - The result is ordered with [`distance_cmp`].
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances as big-endian unsigned integers.
///
/// Returns `Ordering::Less` if `a` represents a smaller distance,
/// `Ordering::Greater` if larger, or `Ordering::Equal` if identical.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

// ============================================================================
// Query Bookkeeping
// ============================================================================

/// Caller-chosen identifier addressing one query within a pool.
///
/// The id must be unique among the queries a pool is currently running;
/// starting a second query under a live id is rejected with
/// [`QueryExists`](crate::error::QueryExists).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", self.0)
    }
}

/// Request counters accumulated over the lifetime of a query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Requests dispatched, including those still awaiting a reply.
    pub requests: usize,
    /// Requests answered by the remote node.
    pub successes: usize,
    /// Requests that ended in a transport failure or timeout.
    pub failures: usize,
}
