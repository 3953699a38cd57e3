//! Wire envelope exchanged between DHT peers.
//!
//! The envelope mirrors the classic Kademlia DHT message layout: one
//! [`Message`] type tagged with a [`MessageType`], carrying the key being
//! operated on, an optional [`Record`] for value transfer, and peer lists
//! for iterative routing. Encoding to a concrete wire format is the
//! transport's concern; the coordination core only builds and inspects
//! these values, and hands them through the state machines as an opaque
//! payload.

use serde::{Deserialize, Serialize};

use crate::core::{Key, NodeId};

/// Discriminates what a [`Message`] asks the receiver to do.
///
/// The numeric values match the original wire definition and must not be
/// reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Store the attached record.
    PutValue = 0,
    /// Return the record for `key`, or closer peers.
    GetValue = 1,
    /// Register the sender as a provider for `key`.
    AddProvider = 2,
    /// Return providers for `key`, or closer peers.
    GetProviders = 3,
    /// Return the peers closest to `key`.
    FindNode = 4,
    /// Liveness check.
    Ping = 5,
}

/// How the sender assesses its connection to a peer it is reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionType {
    /// No current connection; liveness unknown.
    #[default]
    NotConnected = 0,
    /// An open, working connection.
    Connected = 1,
    /// Recently connected; a new connection should succeed.
    CanConnect = 2,
    /// A recent connection attempt failed.
    CannotConnect = 3,
}

/// A peer reference carried in `closer_peers` / `provider_peers`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// The peer's identity bytes.
    pub id: Vec<u8>,
    /// The peer's known addresses, each in the transport's binary form.
    pub addrs: Vec<Vec<u8>>,
    /// The sender's connection assessment for this peer.
    pub connection: ConnectionType,
}

impl Peer {
    /// Reference a peer by id alone, with no known addresses.
    pub fn from_node_id(id: NodeId) -> Self {
        Self {
            id: id.to_vec(),
            addrs: Vec::new(),
            connection: ConnectionType::NotConnected,
        }
    }
}

/// A stored value together with the key it lives under.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The key the record is addressed by.
    pub key: Vec<u8>,
    /// The record payload.
    pub value: Vec<u8>,
    /// RFC 3339 timestamp of when the sender received the record, if known.
    pub time_received: Option<String>,
}

/// Top-level envelope for every DHT RPC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// What the receiver is being asked to do.
    pub message_type: MessageType,
    /// Reserved legacy field (wire tag 10). Always written as zero and
    /// ignored on read.
    #[serde(default)]
    pub cluster_level_raw: i32,
    /// The key the request operates on.
    pub key: Vec<u8>,
    /// The record being written or returned, for `PutValue` / `GetValue`.
    pub record: Option<Record>,
    /// Peers closer to `key` than the sender, for iterative lookups.
    pub closer_peers: Vec<Peer>,
    /// Peers that provide `key`, for provider queries.
    pub provider_peers: Vec<Peer>,
}

impl Message {
    /// Envelope with the given type and key and nothing else.
    fn envelope(message_type: MessageType, key: &[u8]) -> Self {
        Self {
            message_type,
            cluster_level_raw: 0,
            key: key.to_vec(),
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
        }
    }

    /// Build a `PUT_VALUE` message storing `value` under `key`.
    ///
    /// This is the payload a follow-up broadcast hands to each of the
    /// discovered closest nodes:
    ///
    /// ```
    /// use sdht_coord::key_for_content;
    /// use sdht_coord::protocol::{Message, MessageType};
    ///
    /// let value = b"hello world".to_vec();
    /// let key = key_for_content(&value);
    /// let msg = Message::put_value(key, value);
    /// assert_eq!(msg.message_type, MessageType::PutValue);
    /// assert_eq!(msg.record.unwrap().key, key.to_vec());
    /// ```
    pub fn put_value(key: Key, value: Vec<u8>) -> Self {
        let mut msg = Self::envelope(MessageType::PutValue, &key);
        msg.record = Some(Record {
            key: key.to_vec(),
            value,
            time_received: None,
        });
        msg
    }

    /// Build a `GET_VALUE` request for `key`.
    pub fn get_value(key: Key) -> Self {
        Self::envelope(MessageType::GetValue, &key)
    }

    /// Build a `FIND_NODE` request for the peers closest to `target`.
    pub fn find_node(target: Key) -> Self {
        Self::envelope(MessageType::FindNode, &target)
    }

    /// Build a `PING` message.
    pub fn ping() -> Self {
        Self::envelope(MessageType::Ping, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_for_content;

    #[test]
    fn put_value_carries_record_under_the_content_key() {
        let value = b"payload".to_vec();
        let key = key_for_content(&value);
        let msg = Message::put_value(key, value.clone());

        assert_eq!(msg.message_type, MessageType::PutValue);
        assert_eq!(msg.key, key.to_vec());
        assert_eq!(msg.cluster_level_raw, 0);
        let record = msg.record.expect("put_value must carry a record");
        assert_eq!(record.key, key.to_vec());
        assert_eq!(record.value, value);
    }

    #[test]
    fn find_node_has_no_record() {
        let msg = Message::find_node([7u8; 32]);
        assert_eq!(msg.message_type, MessageType::FindNode);
        assert!(msg.record.is_none());
        assert!(msg.closer_peers.is_empty());
        assert!(msg.provider_peers.is_empty());
    }

    #[test]
    fn peer_from_node_id_defaults_to_not_connected() {
        let peer = Peer::from_node_id([3u8; 32]);
        assert_eq!(peer.id, vec![3u8; 32]);
        assert!(peer.addrs.is_empty());
        assert_eq!(peer.connection, ConnectionType::NotConnected);
    }

    #[test]
    fn reserved_cluster_level_defaults_to_zero_on_read() {
        // an envelope serialised by an older peer may omit the field
        let json = r#"{
            "message_type": "FindNode",
            "key": [1, 2, 3],
            "record": null,
            "closer_peers": [],
            "provider_peers": []
        }"#;
        let msg: Message = serde_json::from_str(json).expect("envelope parses");
        assert_eq!(msg.cluster_level_raw, 0);
    }
}
