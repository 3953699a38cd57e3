//! Event actors gluing the state machines to the transport and to callers.
//!
//! A behaviour is a plain `notify` / `ready` / `perform` triple that any
//! outer driver loop can embed:
//!
//! - [`QueryBehaviour::notify`] accepts an inbound event. It only appends
//!   to a queue under a small mutex and signals readiness, so transport
//!   threads never wait on state-machine work.
//! - [`QueryBehaviour::ready`] resolves when there is work to perform. The
//!   signal is a single-slot coalescing wakeup, not a counter.
//! - [`QueryBehaviour::perform`] drives one unit of work under an exclusive
//!   advance lock and returns the next outbound command, if any.
//!
//! Callers may register a waiter per query to receive progress and exactly
//! one terminal update. Waiter delivery is best-effort and non-blocking; a
//! slow caller can lose updates but can never stall the behaviour.
//!
//! [`BroadcastBehaviour`] is the same triple wrapped around a
//! [`BroadcastPool`] for publish-style operations.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::broadcast::{BroadcastPool, BroadcastPoolEvent, BroadcastPoolState, MessageFactory};
use crate::core::{Key, NodeId, QueryId, QueryStats};
use crate::error::{ConfigurationError, NodeError, QueryExists};
use crate::pool::{Pool, PoolConfig, PoolEvent, PoolState};

/// Default capacity of waiter channels created with `channel`.
const WAITER_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Waiters
// ============================================================================

/// Updates delivered to a query's waiter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryUpdate {
    /// A node answered; the lookup made progress.
    Progressed { query_id: QueryId, node: NodeId },
    /// Terminal: the lookup completed with the closest responding nodes.
    Finished {
        query_id: QueryId,
        closest_nodes: Vec<NodeId>,
        stats: QueryStats,
    },
    /// Terminal: the lookup was failed for lack of progress.
    TimedOut { query_id: QueryId },
    /// Terminal: the query was never started because its id is taken.
    Rejected {
        query_id: QueryId,
        error: QueryExists,
    },
}

/// Caller-supplied notifier receiving [`QueryUpdate`]s for one query.
///
/// The behaviour drops the waiter after the terminal update, which closes
/// the receiving end.
#[derive(Clone, Debug)]
pub struct QueryWaiter {
    tx: mpsc::Sender<QueryUpdate>,
}

impl QueryWaiter {
    /// Create a waiter and the receiver the caller listens on.
    pub fn channel() -> (Self, mpsc::Receiver<QueryUpdate>) {
        let (tx, rx) = mpsc::channel(WAITER_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Deliver an update without blocking; a full channel drops it.
    fn notify(&self, update: QueryUpdate) {
        let _ = self.tx.try_send(update);
    }
}

/// Updates delivered to a broadcast's waiter.
#[derive(Clone, Debug)]
pub enum BroadcastUpdate {
    /// Terminal: the broadcast completed.
    Finished {
        query_id: QueryId,
        /// Every node the store phase addressed, in discovery order.
        contacted: Vec<NodeId>,
        /// The nodes that did not store the record, with the reason.
        errors: HashMap<NodeId, NodeError>,
    },
    /// Terminal: the broadcast was never started because its id is taken.
    Rejected {
        query_id: QueryId,
        error: QueryExists,
    },
}

/// Caller-supplied notifier receiving [`BroadcastUpdate`]s for one
/// broadcast.
#[derive(Clone, Debug)]
pub struct BroadcastWaiter {
    tx: mpsc::Sender<BroadcastUpdate>,
}

impl BroadcastWaiter {
    /// Create a waiter and the receiver the caller listens on.
    pub fn channel() -> (Self, mpsc::Receiver<BroadcastUpdate>) {
        let (tx, rx) = mpsc::channel(WAITER_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    fn notify(&self, update: BroadcastUpdate) {
        let _ = self.tx.try_send(update);
    }
}

// ============================================================================
// Query behaviour
// ============================================================================

/// Inbound events accepted by [`QueryBehaviour::notify`].
#[derive(Debug)]
pub enum QueryBehaviourEvent<M> {
    /// Start an iterative closest-nodes lookup.
    StartFindCloserQuery {
        query_id: QueryId,
        target: Key,
        seed: Vec<NodeId>,
        waiter: Option<QueryWaiter>,
    },
    /// Start a lookup that delivers `message` to each contacted node.
    StartMessageQuery {
        query_id: QueryId,
        target: Key,
        message: M,
        seed: Vec<NodeId>,
        waiter: Option<QueryWaiter>,
    },
    /// Terminate a query early with whatever has succeeded.
    StopQuery { query_id: QueryId },
    /// The transport received closer nodes from `node`.
    GetCloserNodesSuccess {
        query_id: QueryId,
        node: NodeId,
        closer_nodes: Vec<NodeId>,
    },
    /// The transport failed to get closer nodes from `node`.
    GetCloserNodesFailure {
        query_id: QueryId,
        node: NodeId,
        error: NodeError,
    },
    /// The transport delivered a query message and received closer nodes.
    SendMessageSuccess {
        query_id: QueryId,
        node: NodeId,
        closer_nodes: Vec<NodeId>,
    },
    /// The transport failed to deliver a query message.
    SendMessageFailure {
        query_id: QueryId,
        node: NodeId,
        error: NodeError,
    },
}

/// Outbound commands returned by [`QueryBehaviour::perform`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryCommand<M> {
    /// Ask `node` for peers closer to `target`; the transport reports back
    /// with [`QueryBehaviourEvent::GetCloserNodesSuccess`] or
    /// [`QueryBehaviourEvent::GetCloserNodesFailure`].
    GetCloserNodes {
        query_id: QueryId,
        node: NodeId,
        target: Key,
    },
    /// Deliver `message` to `node`; the transport reports back with
    /// [`QueryBehaviourEvent::SendMessageSuccess`] or
    /// [`QueryBehaviourEvent::SendMessageFailure`].
    SendMessage {
        query_id: QueryId,
        node: NodeId,
        message: M,
    },
    /// A node answered a request; hand it to routing-table maintenance.
    AddNode { node: NodeId },
    /// A node was unreachable; routing maintenance may want to demote it.
    NotifyNonConnectivity { node: NodeId },
}

/// Pool state plus everything only touched under the advance lock.
struct QueryAdvanceState<M> {
    pool: Pool<M>,
    waiters: HashMap<QueryId, QueryWaiter>,
    outbound: VecDeque<QueryCommand<M>>,
}

/// Event actor multiplexing queries for the local node.
pub struct QueryBehaviour<M> {
    /// Inbound events awaiting processing. The only cross-thread mutable
    /// structure; held only long enough to push or pop one event.
    inbound: Mutex<VecDeque<QueryBehaviourEvent<M>>>,
    /// Pool, waiters and outbound queue, serialized by this lock.
    advance: Mutex<QueryAdvanceState<M>>,
    /// Single-slot coalescing wakeup.
    ready: Notify,
}

impl<M: Clone> QueryBehaviour<M> {
    /// Create a behaviour for the local node `self_id`.
    pub fn new(self_id: NodeId, config: PoolConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            inbound: Mutex::new(VecDeque::new()),
            advance: Mutex::new(QueryAdvanceState {
                pool: Pool::new(self_id, config)?,
                waiters: HashMap::new(),
                outbound: VecDeque::new(),
            }),
            ready: Notify::new(),
        })
    }

    /// Submit an inbound event. Never blocks on state-machine work.
    pub fn notify(&self, event: QueryBehaviourEvent<M>) {
        self.inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .push_back(event);
        self.ready.notify_one();
    }

    /// Resolve when the behaviour has work to perform.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Drive one unit of work and return the next outbound command, if any.
    pub fn perform(&self) -> Option<QueryCommand<M>> {
        let mut advance = self.advance.lock().expect("advance lock poisoned");

        let result = if let Some(command) = advance.outbound.pop_front() {
            Some(command)
        } else if let Some(event) = self.pop_inbound() {
            Self::perform_inbound(&mut advance, event).or_else(|| advance.outbound.pop_front())
        } else {
            Self::advance_pool(&mut advance, PoolEvent::Poll)
                .or_else(|| advance.outbound.pop_front())
        };

        self.signal_if_pending(&advance);
        result
    }

    fn pop_inbound(&self) -> Option<QueryBehaviourEvent<M>> {
        self.inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .pop_front()
    }

    /// Re-signal readiness if queued work remains after a perform.
    fn signal_if_pending(&self, advance: &QueryAdvanceState<M>) {
        if !advance.outbound.is_empty() {
            self.ready.notify_one();
            return;
        }
        let has_inbound = !self
            .inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .is_empty();
        if has_inbound {
            self.ready.notify_one();
        }
    }

    /// Translate one inbound event into a pool event and advance the pool.
    fn perform_inbound(
        advance: &mut QueryAdvanceState<M>,
        event: QueryBehaviourEvent<M>,
    ) -> Option<QueryCommand<M>> {
        match event {
            QueryBehaviourEvent::StartFindCloserQuery {
                query_id,
                target,
                seed,
                waiter,
            } => {
                if Self::reject_duplicate(advance, query_id, waiter.as_ref()) {
                    return None;
                }
                if let Some(waiter) = waiter {
                    advance.waiters.insert(query_id, waiter);
                }
                Self::advance_pool(
                    advance,
                    PoolEvent::AddFindCloserQuery {
                        query_id,
                        target,
                        seed,
                    },
                )
            }
            QueryBehaviourEvent::StartMessageQuery {
                query_id,
                target,
                message,
                seed,
                waiter,
            } => {
                if Self::reject_duplicate(advance, query_id, waiter.as_ref()) {
                    return None;
                }
                if let Some(waiter) = waiter {
                    advance.waiters.insert(query_id, waiter);
                }
                Self::advance_pool(
                    advance,
                    PoolEvent::AddMessageQuery {
                        query_id,
                        target,
                        message,
                        seed,
                    },
                )
            }
            QueryBehaviourEvent::StopQuery { query_id } => {
                Self::advance_pool(advance, PoolEvent::StopQuery { query_id })
            }
            QueryBehaviourEvent::GetCloserNodesSuccess {
                query_id,
                node,
                closer_nodes,
            }
            | QueryBehaviourEvent::SendMessageSuccess {
                query_id,
                node,
                closer_nodes,
            } => {
                for closer in &closer_nodes {
                    advance
                        .outbound
                        .push_back(QueryCommand::AddNode { node: *closer });
                }
                if let Some(waiter) = advance.waiters.get(&query_id) {
                    waiter.notify(QueryUpdate::Progressed { query_id, node });
                }
                Self::advance_pool(
                    advance,
                    PoolEvent::NodeResponse {
                        query_id,
                        node,
                        closer_nodes,
                    },
                )
            }
            QueryBehaviourEvent::GetCloserNodesFailure {
                query_id,
                node,
                error,
            }
            | QueryBehaviourEvent::SendMessageFailure {
                query_id,
                node,
                error,
            } => {
                debug!(
                    %query_id,
                    node = %hex::encode(&node[..8]),
                    %error,
                    "peer has no connectivity"
                );
                advance
                    .outbound
                    .push_back(QueryCommand::NotifyNonConnectivity { node });
                Self::advance_pool(
                    advance,
                    PoolEvent::NodeFailure {
                        query_id,
                        node,
                        error,
                    },
                )
            }
        }
    }

    /// Answer a duplicate start with a terminal rejection on the new
    /// waiter, leaving the running query untouched.
    fn reject_duplicate(
        advance: &QueryAdvanceState<M>,
        query_id: QueryId,
        waiter: Option<&QueryWaiter>,
    ) -> bool {
        if !advance.pool.contains(query_id) && !advance.waiters.contains_key(&query_id) {
            return false;
        }
        debug!(%query_id, "rejecting duplicate query");
        if let Some(waiter) = waiter {
            waiter.notify(QueryUpdate::Rejected {
                query_id,
                error: QueryExists(query_id),
            });
        }
        true
    }

    /// Advance the pool and fan its output out to transport commands and
    /// waiter notifications.
    fn advance_pool(
        advance: &mut QueryAdvanceState<M>,
        event: PoolEvent<M>,
    ) -> Option<QueryCommand<M>> {
        match advance.pool.advance(event) {
            PoolState::FindCloser {
                query_id,
                node,
                target,
            } => Some(QueryCommand::GetCloserNodes {
                query_id,
                node,
                target,
            }),
            PoolState::SendMessage {
                query_id,
                node,
                message,
            } => Some(QueryCommand::SendMessage {
                query_id,
                node,
                message,
            }),
            PoolState::WaitingAtCapacity | PoolState::WaitingWithCapacity => None,
            PoolState::QueryFinished {
                query_id,
                closest_nodes,
                stats,
            } => {
                if let Some(waiter) = advance.waiters.remove(&query_id) {
                    waiter.notify(QueryUpdate::Finished {
                        query_id,
                        closest_nodes,
                        stats,
                    });
                }
                None
            }
            PoolState::QueryTimeout { query_id } => {
                if let Some(waiter) = advance.waiters.remove(&query_id) {
                    waiter.notify(QueryUpdate::TimedOut { query_id });
                }
                None
            }
            PoolState::Idle => None,
        }
    }
}

// ============================================================================
// Broadcast behaviour
// ============================================================================

/// Inbound events accepted by [`BroadcastBehaviour::notify`].
pub enum BroadcastBehaviourEvent<M> {
    /// Start a follow-up broadcast: find the closest nodes to `target`,
    /// then store the factory's message with each of them.
    StartBroadcast {
        query_id: QueryId,
        target: Key,
        msg_fn: MessageFactory<M>,
        seed: Vec<NodeId>,
        waiter: Option<BroadcastWaiter>,
    },
    /// Cancel a running broadcast.
    StopBroadcast { query_id: QueryId },
    /// The transport received closer nodes from `node`.
    GetCloserNodesSuccess {
        query_id: QueryId,
        node: NodeId,
        closer_nodes: Vec<NodeId>,
    },
    /// The transport failed to get closer nodes from `node`.
    GetCloserNodesFailure {
        query_id: QueryId,
        node: NodeId,
        error: NodeError,
    },
    /// A node acknowledged a stored record.
    StoreRecordSuccess { query_id: QueryId, node: NodeId },
    /// A node failed to store a record.
    StoreRecordFailure {
        query_id: QueryId,
        node: NodeId,
        error: NodeError,
    },
}

/// Outbound commands returned by [`BroadcastBehaviour::perform`].
#[derive(Clone, Debug)]
pub enum BroadcastCommand<M> {
    /// Ask `node` for peers closer to `target`.
    GetCloserNodes {
        query_id: QueryId,
        node: NodeId,
        target: Key,
    },
    /// Store `message` with `node`; the transport reports back with
    /// [`BroadcastBehaviourEvent::StoreRecordSuccess`] or
    /// [`BroadcastBehaviourEvent::StoreRecordFailure`].
    StoreRecord {
        query_id: QueryId,
        node: NodeId,
        target: Key,
        message: M,
    },
    /// A node answered a request; hand it to routing-table maintenance.
    AddNode { node: NodeId },
    /// A node was unreachable; routing maintenance may want to demote it.
    NotifyNonConnectivity { node: NodeId },
}

struct BroadcastAdvanceState<M> {
    pool: BroadcastPool<M>,
    waiters: HashMap<QueryId, BroadcastWaiter>,
    outbound: VecDeque<BroadcastCommand<M>>,
}

/// Event actor multiplexing follow-up broadcasts for the local node.
pub struct BroadcastBehaviour<M> {
    inbound: Mutex<VecDeque<BroadcastBehaviourEvent<M>>>,
    advance: Mutex<BroadcastAdvanceState<M>>,
    ready: Notify,
}

impl<M: Clone> BroadcastBehaviour<M> {
    /// Create a behaviour for the local node `self_id`.
    pub fn new(self_id: NodeId, config: PoolConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            inbound: Mutex::new(VecDeque::new()),
            advance: Mutex::new(BroadcastAdvanceState {
                pool: BroadcastPool::new(self_id, config)?,
                waiters: HashMap::new(),
                outbound: VecDeque::new(),
            }),
            ready: Notify::new(),
        })
    }

    /// Submit an inbound event. Never blocks on state-machine work.
    pub fn notify(&self, event: BroadcastBehaviourEvent<M>) {
        self.inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .push_back(event);
        self.ready.notify_one();
    }

    /// Resolve when the behaviour has work to perform.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Drive one unit of work and return the next outbound command, if any.
    pub fn perform(&self) -> Option<BroadcastCommand<M>> {
        let mut advance = self.advance.lock().expect("advance lock poisoned");

        let result = if let Some(command) = advance.outbound.pop_front() {
            Some(command)
        } else if let Some(event) = self.pop_inbound() {
            Self::perform_inbound(&mut advance, event).or_else(|| advance.outbound.pop_front())
        } else {
            Self::advance_pool(&mut advance, BroadcastPoolEvent::Poll)
                .or_else(|| advance.outbound.pop_front())
        };

        self.signal_if_pending(&advance);
        result
    }

    fn pop_inbound(&self) -> Option<BroadcastBehaviourEvent<M>> {
        self.inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .pop_front()
    }

    fn signal_if_pending(&self, advance: &BroadcastAdvanceState<M>) {
        if !advance.outbound.is_empty() {
            self.ready.notify_one();
            return;
        }
        let has_inbound = !self
            .inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .is_empty();
        if has_inbound {
            self.ready.notify_one();
        }
    }

    fn perform_inbound(
        advance: &mut BroadcastAdvanceState<M>,
        event: BroadcastBehaviourEvent<M>,
    ) -> Option<BroadcastCommand<M>> {
        match event {
            BroadcastBehaviourEvent::StartBroadcast {
                query_id,
                target,
                msg_fn,
                seed,
                waiter,
            } => {
                if advance.pool.contains(query_id) || advance.waiters.contains_key(&query_id) {
                    debug!(%query_id, "rejecting duplicate broadcast");
                    if let Some(waiter) = waiter {
                        waiter.notify(BroadcastUpdate::Rejected {
                            query_id,
                            error: QueryExists(query_id),
                        });
                    }
                    return None;
                }
                if let Some(waiter) = waiter {
                    advance.waiters.insert(query_id, waiter);
                }
                Self::advance_pool(
                    advance,
                    BroadcastPoolEvent::StartBroadcast {
                        query_id,
                        target,
                        msg_fn,
                        seed,
                    },
                )
            }
            BroadcastBehaviourEvent::StopBroadcast { query_id } => {
                Self::advance_pool(advance, BroadcastPoolEvent::StopBroadcast { query_id })
            }
            BroadcastBehaviourEvent::GetCloserNodesSuccess {
                query_id,
                node,
                closer_nodes,
            } => {
                for closer in &closer_nodes {
                    advance
                        .outbound
                        .push_back(BroadcastCommand::AddNode { node: *closer });
                }
                Self::advance_pool(
                    advance,
                    BroadcastPoolEvent::NodeResponse {
                        query_id,
                        node,
                        closer_nodes,
                    },
                )
            }
            BroadcastBehaviourEvent::GetCloserNodesFailure {
                query_id,
                node,
                error,
            } => {
                debug!(
                    %query_id,
                    node = %hex::encode(&node[..8]),
                    %error,
                    "peer has no connectivity"
                );
                advance
                    .outbound
                    .push_back(BroadcastCommand::NotifyNonConnectivity { node });
                Self::advance_pool(
                    advance,
                    BroadcastPoolEvent::NodeFailure {
                        query_id,
                        node,
                        error,
                    },
                )
            }
            BroadcastBehaviourEvent::StoreRecordSuccess { query_id, node } => {
                Self::advance_pool(
                    advance,
                    BroadcastPoolEvent::StoreRecordSuccess { query_id, node },
                )
            }
            BroadcastBehaviourEvent::StoreRecordFailure {
                query_id,
                node,
                error,
            } => Self::advance_pool(
                advance,
                BroadcastPoolEvent::StoreRecordFailure {
                    query_id,
                    node,
                    error,
                },
            ),
        }
    }

    fn advance_pool(
        advance: &mut BroadcastAdvanceState<M>,
        event: BroadcastPoolEvent<M>,
    ) -> Option<BroadcastCommand<M>> {
        match advance.pool.advance(event) {
            BroadcastPoolState::FindCloser {
                query_id,
                node,
                target,
            } => Some(BroadcastCommand::GetCloserNodes {
                query_id,
                node,
                target,
            }),
            BroadcastPoolState::StoreRecord {
                query_id,
                node,
                target,
                message,
            } => Some(BroadcastCommand::StoreRecord {
                query_id,
                node,
                target,
                message,
            }),
            BroadcastPoolState::Waiting => None,
            BroadcastPoolState::BroadcastFinished {
                query_id,
                contacted,
                errors,
            } => {
                if let Some(waiter) = advance.waiters.remove(&query_id) {
                    waiter.notify(BroadcastUpdate::Finished {
                        query_id,
                        contacted,
                        errors,
                    });
                }
                None
            }
            BroadcastPoolState::Idle => None,
        }
    }
}
