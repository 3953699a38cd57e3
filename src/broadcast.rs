//! Follow-up broadcasts: discover the closest nodes to a key, then store a
//! record with each of them.
//!
//! A [`FollowUp`] composes two phases without the underlying machinery
//! knowing about either. The first phase runs an ordinary closest-nodes
//! query through a [`Pool`]; once that query finishes, the second phase
//! walks the discovered nodes and emits one [`BroadcastState::StoreRecord`]
//! instruction per node, tracking which stores succeeded and which failed.
//!
//! A [`BroadcastPool`] multiplexes several follow-ups over one shared query
//! pool, routing pool output back to the broadcast that owns it.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::core::{Key, NodeId, QueryId};
use crate::error::{ConfigurationError, NodeError};
use crate::pool::{Pool, PoolConfig, PoolEvent, PoolState};

/// Produces the message stored at each discovered node.
///
/// The factory is called once per store instruction so the payload can be
/// assembled lazily from the target key.
pub type MessageFactory<M> = Box<dyn Fn(Key) -> M + Send>;

/// Input events a follow-up broadcast reacts to.
#[derive(Clone, Debug)]
pub enum BroadcastEvent {
    /// Give the broadcast a chance to make progress.
    Poll,
    /// A node answered a closest-nodes request of the query phase.
    NodeResponse {
        node: NodeId,
        closer_nodes: Vec<NodeId>,
    },
    /// A closest-nodes request of the query phase failed.
    NodeFailure { node: NodeId, error: NodeError },
    /// A node acknowledged the stored record.
    StoreRecordSuccess { node: NodeId },
    /// A node failed to store the record.
    StoreRecordFailure { node: NodeId, error: NodeError },
    /// Cancel outstanding work and finish.
    Stop,
}

/// Output states produced by a follow-up broadcast.
#[derive(Debug)]
pub enum BroadcastState<M> {
    /// Forwarded from the underlying query pool: ask `node` for closer
    /// peers.
    FindCloser {
        query_id: QueryId,
        node: NodeId,
        target: Key,
    },
    /// Store the record with `node`.
    StoreRecord {
        query_id: QueryId,
        node: NodeId,
        target: Key,
        message: M,
    },
    /// Waiting on query replies or store acknowledgements.
    Waiting { query_id: QueryId },
    /// The broadcast is complete.
    Finished {
        query_id: QueryId,
        /// Every node the store phase addressed, in discovery order.
        contacted: Vec<NodeId>,
        /// The nodes that did not store the record, with the reason.
        errors: HashMap<NodeId, NodeError>,
    },
    /// Nothing to do.
    Idle,
}

/// State machine for one "find the closest nodes, then store with them"
/// operation.
pub struct FollowUp<M> {
    query_id: QueryId,
    target: Key,
    msg_fn: MessageFactory<M>,
    /// Nodes the closest-nodes query starts from.
    seed: Vec<NodeId>,
    /// Set once the query has been handed to the pool; never reset.
    started: bool,
    /// The query result. Empty until the query phase finishes.
    closest: Vec<NodeId>,
    /// Nodes still owed a store instruction, in discovery order.
    todo: VecDeque<NodeId>,
    /// Nodes with a store request outstanding.
    waiting: HashSet<NodeId>,
    /// Nodes that acknowledged the record.
    success: HashSet<NodeId>,
    /// Nodes that failed to store the record.
    failed: HashMap<NodeId, NodeError>,
    finished: bool,
}

impl<M: Clone> FollowUp<M> {
    /// Create a broadcast for `target`, starting the lookup from `seed`.
    pub fn new(query_id: QueryId, target: Key, msg_fn: MessageFactory<M>, seed: Vec<NodeId>) -> Self {
        Self {
            query_id,
            target,
            msg_fn,
            seed,
            started: false,
            closest: Vec::new(),
            todo: VecDeque::new(),
            waiting: HashSet::new(),
            success: HashSet::new(),
            failed: HashMap::new(),
            finished: false,
        }
    }

    /// The id of this broadcast and of its underlying query.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// The key the record is stored under.
    pub fn target(&self) -> Key {
        self.target
    }

    /// Nodes that acknowledged the record so far.
    pub fn successes(&self) -> usize {
        self.success.len()
    }

    /// Advance the broadcast against the query pool it runs on.
    ///
    /// Events that belong to the query phase are translated into pool
    /// events and forwarded; store acknowledgements are absorbed directly.
    /// At most one store instruction is emitted per call.
    pub fn advance(&mut self, pool: &mut Pool<M>, event: BroadcastEvent) -> BroadcastState<M> {
        let stopping = matches!(event, BroadcastEvent::Stop);
        if let Some(pool_event) = self.handle_event(event) {
            let pool_state = pool.advance(pool_event);
            if let Some(state) = self.absorb_pool_state(pool_state) {
                return state;
            }
        }
        self.next(stopping)
    }

    /// Map a broadcast event to the query pool event it implies, updating
    /// the store-phase bookkeeping for events that do not touch the pool.
    pub(crate) fn handle_event(&mut self, event: BroadcastEvent) -> Option<PoolEvent<M>> {
        match event {
            BroadcastEvent::Poll => {
                if !self.started {
                    self.started = true;
                    return Some(PoolEvent::AddFindCloserQuery {
                        query_id: self.query_id,
                        target: self.target,
                        seed: self.seed.clone(),
                    });
                }
                Some(PoolEvent::Poll)
            }
            BroadcastEvent::NodeResponse { node, closer_nodes } => Some(PoolEvent::NodeResponse {
                query_id: self.query_id,
                node,
                closer_nodes,
            }),
            BroadcastEvent::NodeFailure { node, error } => Some(PoolEvent::NodeFailure {
                query_id: self.query_id,
                node,
                error,
            }),
            BroadcastEvent::StoreRecordSuccess { node } => {
                if self.waiting.remove(&node) {
                    self.success.insert(node);
                }
                None
            }
            BroadcastEvent::StoreRecordFailure { node, error } => {
                if self.waiting.remove(&node) {
                    self.failed.insert(node, error);
                }
                None
            }
            BroadcastEvent::Stop => {
                if self.query_done() {
                    return None;
                }
                Some(PoolEvent::StopQuery {
                    query_id: self.query_id,
                })
            }
        }
    }

    /// Whether the closest-nodes phase has delivered its result.
    fn query_done(&self) -> bool {
        !self.closest.is_empty()
    }

    /// Fold a pool output into the broadcast. Returns a state when the pool
    /// output is terminal for this advance; `None` lets the caller go on to
    /// emit store instructions.
    fn absorb_pool_state(&mut self, state: PoolState<M>) -> Option<BroadcastState<M>> {
        match state {
            PoolState::FindCloser {
                query_id,
                node,
                target,
            } => Some(BroadcastState::FindCloser {
                query_id,
                node,
                target,
            }),
            PoolState::SendMessage { .. } => {
                unreachable!("follow-up broadcasts only run find-closer queries")
            }
            PoolState::WaitingAtCapacity | PoolState::WaitingWithCapacity => {
                Some(BroadcastState::Waiting {
                    query_id: self.query_id,
                })
            }
            PoolState::QueryFinished { closest_nodes, .. } => self.on_query_finished(closest_nodes),
            PoolState::QueryTimeout { .. } => Some(self.on_query_timeout()),
            PoolState::Idle => None,
        }
    }

    /// Record the query result and queue the store phase.
    ///
    /// A query that discovered nothing finishes the broadcast immediately
    /// with empty contacted and empty errors.
    pub(crate) fn on_query_finished(&mut self, closest_nodes: Vec<NodeId>) -> Option<BroadcastState<M>> {
        if closest_nodes.is_empty() {
            self.finished = true;
            return Some(BroadcastState::Finished {
                query_id: self.query_id,
                contacted: Vec::new(),
                errors: HashMap::new(),
            });
        }
        self.closest = closest_nodes.clone();
        self.todo.extend(closest_nodes);
        None
    }

    /// A timed-out query leaves nothing to store with.
    pub(crate) fn on_query_timeout(&mut self) -> BroadcastState<M> {
        self.finished = true;
        BroadcastState::Finished {
            query_id: self.query_id,
            contacted: Vec::new(),
            errors: HashMap::new(),
        }
    }

    /// Emit the next store instruction, report waiting, or finish.
    pub(crate) fn next(&mut self, stopping: bool) -> BroadcastState<M> {
        if stopping {
            while let Some(node) = self.todo.pop_front() {
                self.failed.insert(node, NodeError::Cancelled);
            }
            for node in self.waiting.drain() {
                self.failed.insert(node, NodeError::Cancelled);
            }
        }

        if let Some(node) = self.todo.pop_front() {
            self.waiting.insert(node);
            return BroadcastState::StoreRecord {
                query_id: self.query_id,
                node,
                target: self.target,
                message: (self.msg_fn)(self.target),
            };
        }

        if !self.waiting.is_empty() {
            return BroadcastState::Waiting {
                query_id: self.query_id,
            };
        }

        if !self.finished && (stopping || self.query_done()) {
            self.finished = true;
            return BroadcastState::Finished {
                query_id: self.query_id,
                contacted: self.closest.clone(),
                errors: self.failed.clone(),
            };
        }

        BroadcastState::Idle
    }
}

/// Input events for a [`BroadcastPool`].
pub enum BroadcastPoolEvent<M> {
    /// Begin a new follow-up broadcast.
    StartBroadcast {
        query_id: QueryId,
        target: Key,
        msg_fn: MessageFactory<M>,
        seed: Vec<NodeId>,
    },
    /// Cancel a running broadcast.
    StopBroadcast { query_id: QueryId },
    /// A node answered a closest-nodes request.
    NodeResponse {
        query_id: QueryId,
        node: NodeId,
        closer_nodes: Vec<NodeId>,
    },
    /// A closest-nodes request failed.
    NodeFailure {
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
    /// Give the pool a chance to dispatch work or fire timeouts.
    Poll,
}

/// Output states produced by [`BroadcastPool::advance`].
#[derive(Debug)]
pub enum BroadcastPoolState<M> {
    /// Ask `node` for peers closer to `target` on behalf of `query_id`.
    FindCloser {
        query_id: QueryId,
        node: NodeId,
        target: Key,
    },
    /// Store a record with `node` on behalf of `query_id`.
    StoreRecord {
        query_id: QueryId,
        node: NodeId,
        target: Key,
        message: M,
    },
    /// Replies or acknowledgements are outstanding.
    Waiting,
    /// A broadcast completed; it has been removed from the pool.
    BroadcastFinished {
        query_id: QueryId,
        contacted: Vec<NodeId>,
        errors: HashMap<NodeId, NodeError>,
    },
    /// Nothing to do.
    Idle,
}

/// Multiplexes follow-up broadcasts over one shared query pool.
///
/// The query pool's own round-robin and global in-flight bound govern the
/// query phases of all broadcasts together; the broadcast pool routes pool
/// output back to the broadcast owning the query id, so one broadcast's
/// completion or timeout can never be misattributed to another.
pub struct BroadcastPool<M> {
    queries: Pool<M>,
    /// Live broadcasts in insertion order.
    broadcasts: Vec<FollowUp<M>>,
}

impl<M: Clone> BroadcastPool<M> {
    /// Create a broadcast pool for the local node `self_id`.
    pub fn new(self_id: NodeId, config: PoolConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            queries: Pool::new(self_id, config)?,
            broadcasts: Vec::new(),
        })
    }

    /// Whether a broadcast with this id is currently running.
    pub fn contains(&self, query_id: QueryId) -> bool {
        self.index_of(query_id).is_some()
    }

    /// Number of live broadcasts.
    pub fn len(&self) -> usize {
        self.broadcasts.len()
    }

    /// Whether the pool has no live broadcasts.
    pub fn is_empty(&self) -> bool {
        self.broadcasts.is_empty()
    }

    fn index_of(&self, query_id: QueryId) -> Option<usize> {
        self.broadcasts
            .iter()
            .position(|broadcast| broadcast.query_id() == query_id)
    }

    /// Advance the machine with one event.
    pub fn advance(&mut self, event: BroadcastPoolEvent<M>) -> BroadcastPoolState<M> {
        match event {
            BroadcastPoolEvent::StartBroadcast {
                query_id,
                target,
                msg_fn,
                seed,
            } => {
                if self.contains(query_id) {
                    debug!(%query_id, "rejecting duplicate broadcast id");
                } else {
                    self.broadcasts
                        .push(FollowUp::new(query_id, target, msg_fn, seed));
                }
            }
            BroadcastPoolEvent::StopBroadcast { query_id } => {
                let state = self.advance_broadcast(query_id, BroadcastEvent::Stop);
                if !matches!(state, BroadcastPoolState::Idle) {
                    return state;
                }
            }
            BroadcastPoolEvent::NodeResponse {
                query_id,
                node,
                closer_nodes,
            } => {
                let state = self
                    .advance_broadcast(query_id, BroadcastEvent::NodeResponse { node, closer_nodes });
                if !matches!(state, BroadcastPoolState::Idle) {
                    return state;
                }
            }
            BroadcastPoolEvent::NodeFailure {
                query_id,
                node,
                error,
            } => {
                let state = self.advance_broadcast(query_id, BroadcastEvent::NodeFailure { node, error });
                if !matches!(state, BroadcastPoolState::Idle) {
                    return state;
                }
            }
            BroadcastPoolEvent::StoreRecordSuccess { query_id, node } => {
                let state = self.advance_broadcast(query_id, BroadcastEvent::StoreRecordSuccess { node });
                if !matches!(state, BroadcastPoolState::Idle) {
                    return state;
                }
            }
            BroadcastPoolEvent::StoreRecordFailure {
                query_id,
                node,
                error,
            } => {
                let state =
                    self.advance_broadcast(query_id, BroadcastEvent::StoreRecordFailure { node, error });
                if !matches!(state, BroadcastPoolState::Idle) {
                    return state;
                }
            }
            BroadcastPoolEvent::Poll => {}
        }
        self.poll_broadcasts()
    }

    /// Advance one broadcast with one event. Returns `Idle` when the id is
    /// unknown (late event after completion).
    fn advance_broadcast(&mut self, query_id: QueryId, event: BroadcastEvent) -> BroadcastPoolState<M> {
        let Some(index) = self.index_of(query_id) else {
            return BroadcastPoolState::Idle;
        };
        let stopping = matches!(event, BroadcastEvent::Stop);

        if let Some(pool_event) = self.broadcasts[index].handle_event(event) {
            let pool_state = self.queries.advance(pool_event);
            if let Some(out) = self.route_pool_state(pool_state) {
                return out;
            }
        }

        // routing may have completed and removed this broadcast
        let Some(index) = self.index_of(query_id) else {
            return BroadcastPoolState::Idle;
        };
        let state = self.broadcasts[index].next(stopping);
        self.lift_broadcast_state(index, state)
    }

    /// Hand a query pool output to the broadcast that owns it.
    fn route_pool_state(&mut self, state: PoolState<M>) -> Option<BroadcastPoolState<M>> {
        match state {
            PoolState::FindCloser {
                query_id,
                node,
                target,
            } => Some(BroadcastPoolState::FindCloser {
                query_id,
                node,
                target,
            }),
            PoolState::SendMessage { .. } => {
                unreachable!("follow-up broadcasts only run find-closer queries")
            }
            PoolState::WaitingAtCapacity | PoolState::WaitingWithCapacity => {
                Some(BroadcastPoolState::Waiting)
            }
            PoolState::QueryFinished {
                query_id,
                closest_nodes,
                ..
            } => {
                let index = self.index_of(query_id)?;
                match self.broadcasts[index].on_query_finished(closest_nodes) {
                    Some(state) => Some(self.lift_broadcast_state(index, state)),
                    None => None,
                }
            }
            PoolState::QueryTimeout { query_id } => {
                let index = self.index_of(query_id)?;
                let state = self.broadcasts[index].on_query_timeout();
                Some(self.lift_broadcast_state(index, state))
            }
            PoolState::Idle => None,
        }
    }

    /// Translate a broadcast's output into a pool output, removing finished
    /// broadcasts.
    fn lift_broadcast_state(&mut self, index: usize, state: BroadcastState<M>) -> BroadcastPoolState<M> {
        match state {
            BroadcastState::FindCloser {
                query_id,
                node,
                target,
            } => BroadcastPoolState::FindCloser {
                query_id,
                node,
                target,
            },
            BroadcastState::StoreRecord {
                query_id,
                node,
                target,
                message,
            } => BroadcastPoolState::StoreRecord {
                query_id,
                node,
                target,
                message,
            },
            BroadcastState::Waiting { .. } => BroadcastPoolState::Waiting,
            BroadcastState::Finished {
                query_id,
                contacted,
                errors,
            } => {
                self.broadcasts.remove(index);
                BroadcastPoolState::BroadcastFinished {
                    query_id,
                    contacted,
                    errors,
                }
            }
            BroadcastState::Idle => BroadcastPoolState::Idle,
        }
    }

    /// Give every broadcast a chance to make progress.
    fn poll_broadcasts(&mut self) -> BroadcastPoolState<M> {
        let mut waiting = false;
        let mut index = 0;
        while index < self.broadcasts.len() {
            let query_id = self.broadcasts[index].query_id();
            match self.advance_broadcast(query_id, BroadcastEvent::Poll) {
                BroadcastPoolState::Idle => index += 1,
                BroadcastPoolState::Waiting => {
                    waiting = true;
                    index += 1;
                }
                other => return other,
            }
        }
        if waiting {
            BroadcastPoolState::Waiting
        } else {
            BroadcastPoolState::Idle
        }
    }
}
