//! # sDHT Coordination Core
//!
//! This crate is the transport-agnostic query coordination core of a
//! Kademlia-style sloppy DHT node. It schedules and drives multi-hop
//! iterative lookups across a peer-to-peer overlay: it decides which remote
//! nodes to contact next, bounds in-flight work, handles timeouts and
//! failures, surfaces progress to callers, and follows publish-style
//! operations up with a per-node store step.
//!
//! Everything is built from deterministic state machines glued to small
//! event actors, so the whole pipeline can be unit tested without a network
//! or a real clock. The crate is split into a handful of modules that can
//! be reused independently:
//!
//! - [`core`]: identity aliases, XOR distance ordering, and query
//!   bookkeeping shared by every layer.
//! - [`query`]: the per-lookup state machine maintaining the candidate
//!   frontier.
//! - [`pool`]: the multiplexer running many queries under one global
//!   in-flight bound.
//! - [`broadcast`]: follow-up broadcasts that store a record with the
//!   closest discovered nodes, and the pool multiplexing them.
//! - [`behaviour`]: the `notify` / `ready` / `perform` event actors an
//!   outer driver embeds.
//! - [`protocol`]: the serialisable wire envelope handed through the
//!   machines as an opaque payload.
//! - [`clock`]: the pluggable time source used for progress timeouts.
//! - [`error`]: typed configuration, rejection, and per-node errors.
//!
//! ## Getting started
//!
//! Construct a [`QueryBehaviour`], start a query with a waiter, and drive
//! the behaviour from your event loop, handing outbound commands to your
//! transport:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sdht_coord::behaviour::{QueryBehaviour, QueryBehaviourEvent, QueryCommand, QueryWaiter};
//! use sdht_coord::pool::PoolConfig;
//! use sdht_coord::protocol::Message;
//! use sdht_coord::{derive_node_id, QueryId};
//!
//! # async fn run() -> Result<(), sdht_coord::error::ConfigurationError> {
//! let self_id = derive_node_id(b"local-public-key");
//! let behaviour: Arc<QueryBehaviour<Message>> =
//!     Arc::new(QueryBehaviour::new(self_id, PoolConfig::default())?);
//!
//! let (waiter, mut updates) = QueryWaiter::channel();
//! behaviour.notify(QueryBehaviourEvent::StartFindCloserQuery {
//!     query_id: QueryId(1),
//!     target: derive_node_id(b"lookup-target"),
//!     seed: vec![derive_node_id(b"bootstrap-peer")],
//!     waiter: Some(waiter),
//! });
//!
//! loop {
//!     behaviour.ready().await;
//!     while let Some(command) = behaviour.perform() {
//!         match command {
//!             QueryCommand::GetCloserNodes { .. } => {
//!                 // hand to the transport; it answers through
//!                 // notify(GetCloserNodesSuccess / GetCloserNodesFailure)
//!             }
//!             QueryCommand::SendMessage { .. } => {
//!                 // likewise, for message-carrying queries
//!             }
//!             QueryCommand::AddNode { .. }
//!             | QueryCommand::NotifyNonConnectivity { .. } => {
//!                 // routing table maintenance
//!             }
//!         }
//!     }
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Progress and completion arrive on `updates`; the channel closes after
//! the terminal update. Publish-style operations use
//! [`behaviour::BroadcastBehaviour`] the same way, with
//! [`protocol::Message::put_value`] as the stored payload.

pub mod behaviour;
pub mod broadcast;
pub mod clock;
pub mod core;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod query;

pub use crate::behaviour::{
    BroadcastBehaviour, BroadcastBehaviourEvent, BroadcastCommand, BroadcastUpdate,
    BroadcastWaiter, QueryBehaviour, QueryBehaviourEvent, QueryCommand, QueryUpdate, QueryWaiter,
};
pub use crate::broadcast::{BroadcastPool, FollowUp, MessageFactory};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::{
    derive_node_id, distance_cmp, key_for_content, xor_distance, Key, NodeId, QueryId, QueryStats,
};
pub use crate::error::{ConfigurationError, NodeError, QueryExists};
pub use crate::pool::{Pool, PoolConfig};
pub use crate::query::{NodeState, Query};
