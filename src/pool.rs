//! Query multiplexer.
//!
//! A [`Pool`] runs many [`Query`] state machines at once while keeping the
//! total number of in-flight requests under a global bound. Queries are
//! advanced round-robin in insertion order so a single hot lookup cannot
//! starve the others, and a query that stops making progress is failed with
//! a timeout.
//!
//! Like the query machine, the pool is a pure synchronous transition
//! function: [`Pool::advance`] consumes one [`PoolEvent`] and yields one
//! [`PoolState`]. Time is sampled through the configured [`Clock`] so tests
//! can drive timeouts deterministically.

use std::fmt;
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::core::{Key, NodeId, QueryId, QueryStats};
use crate::error::{ConfigurationError, NodeError};
use crate::query::{Query, QueryEvent, QueryState};

/// Tuning knobs for a [`Pool`] and the queries it spawns.
#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of requests the pool keeps in flight across all
    /// queries.
    pub concurrency: usize,
    /// How long a query may go without a successful response before it is
    /// failed with a timeout.
    pub timeout: Duration,
    /// Maximum number of requests a single query keeps in flight.
    pub request_concurrency: usize,
    /// Deadline for a single request. The transport owns the timer and
    /// reports expiry as a node failure; the value lives here so transport
    /// and pool are configured together.
    pub request_timeout: Duration,
    /// Size of the closest-K window: how many closest nodes a query tracks
    /// actively and returns on completion.
    pub num_results: usize,
    /// Time source for progress stamps and timeout checks.
    pub clock: Arc<dyn Clock>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout: Duration::from_secs(5 * 60),
            request_concurrency: 3,
            request_timeout: Duration::from_secs(60),
            num_results: 20,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("request_concurrency", &self.request_concurrency)
            .field("request_timeout", &self.request_timeout)
            .field("num_results", &self.num_results)
            .finish_non_exhaustive()
    }
}

impl PoolConfig {
    /// Check every constraint, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.concurrency < 1 {
            return Err(ConfigurationError::new(
                "PoolConfig",
                "concurrency must be at least 1",
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigurationError::new(
                "PoolConfig",
                "timeout must be non-zero",
            ));
        }
        if self.request_concurrency < 1 {
            return Err(ConfigurationError::new(
                "PoolConfig",
                "request concurrency must be at least 1",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigurationError::new(
                "PoolConfig",
                "request timeout must be non-zero",
            ));
        }
        if self.num_results < 1 {
            return Err(ConfigurationError::new(
                "PoolConfig",
                "num_results must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Input events a pool reacts to.
#[derive(Clone, Debug)]
pub enum PoolEvent<M> {
    /// Start a "find closer nodes" query.
    AddFindCloserQuery {
        query_id: QueryId,
        target: Key,
        seed: Vec<NodeId>,
    },
    /// Start a query that delivers `message` to each contacted node.
    AddMessageQuery {
        query_id: QueryId,
        target: Key,
        message: M,
        seed: Vec<NodeId>,
    },
    /// Terminate a query early with whatever has succeeded.
    StopQuery { query_id: QueryId },
    /// A node answered a request belonging to `query_id`.
    NodeResponse {
        query_id: QueryId,
        node: NodeId,
        closer_nodes: Vec<NodeId>,
    },
    /// A request belonging to `query_id` failed.
    NodeFailure {
        query_id: QueryId,
        node: NodeId,
        error: NodeError,
    },
    /// Give the pool a chance to dispatch work or fire timeouts.
    Poll,
}

/// Output states produced by [`Pool::advance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolState<M> {
    /// Ask `node` for peers closer to `target` on behalf of `query_id`.
    FindCloser {
        query_id: QueryId,
        node: NodeId,
        target: Key,
    },
    /// Deliver a query's message payload to `node`.
    SendMessage {
        query_id: QueryId,
        node: NodeId,
        message: M,
    },
    /// The global in-flight bound is exhausted.
    WaitingAtCapacity,
    /// No query can dispatch right now but replies are outstanding.
    WaitingWithCapacity,
    /// A query completed; it has been removed from the pool.
    QueryFinished {
        query_id: QueryId,
        closest_nodes: Vec<NodeId>,
        stats: QueryStats,
    },
    /// A query went too long without progress; it has been removed.
    QueryTimeout { query_id: QueryId },
    /// Nothing to do.
    Idle,
}

/// State machine multiplexing queries under a shared request budget.
#[derive(Debug)]
pub struct Pool<M> {
    self_id: NodeId,
    config: PoolConfig,
    /// Live queries in insertion order.
    queries: Vec<Query<M>>,
    /// Round-robin cursor into `queries`.
    next_query_index: usize,
}

impl<M: Clone> Pool<M> {
    /// Create a pool for the local node `self_id`.
    pub fn new(self_id: NodeId, config: PoolConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            self_id,
            config,
            queries: Vec::new(),
            next_query_index: 0,
        })
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether a query with this id is currently running.
    pub fn contains(&self, query_id: QueryId) -> bool {
        self.queries.iter().any(|query| query.id() == query_id)
    }

    /// Number of live queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Whether the pool has no live queries.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Requests in flight across all queries.
    pub fn in_flight(&self) -> usize {
        self.queries.iter().map(|query| query.in_flight()).sum()
    }

    /// Advance the machine with one event.
    pub fn advance(&mut self, event: PoolEvent<M>) -> PoolState<M> {
        let now = self.config.clock.now();
        match event {
            PoolEvent::AddFindCloserQuery {
                query_id,
                target,
                seed,
            } => {
                self.add_query(now, query_id, target, None, &seed);
            }
            PoolEvent::AddMessageQuery {
                query_id,
                target,
                message,
                seed,
            } => {
                self.add_query(now, query_id, target, Some(message), &seed);
            }
            PoolEvent::StopQuery { query_id } => {
                if let Some(index) = self.index_of(query_id) {
                    let state = self.queries[index].advance(now, QueryEvent::Stop);
                    if let Some(out) = self.absorb_query_state(index, state) {
                        return out;
                    }
                }
            }
            PoolEvent::NodeResponse {
                query_id,
                node,
                closer_nodes,
            } => {
                if let Some(index) = self.index_of(query_id) {
                    let state = self.queries[index]
                        .advance(now, QueryEvent::NodeResponse { node, closer_nodes });
                    if let Some(out) = self.absorb_query_state(index, state) {
                        return out;
                    }
                }
            }
            PoolEvent::NodeFailure {
                query_id,
                node,
                error,
            } => {
                if let Some(index) = self.index_of(query_id) {
                    debug!(%query_id, node = %hex::encode(&node[..8]), %error, "node failed");
                    let state =
                        self.queries[index].advance(now, QueryEvent::NodeFailure { node, error });
                    if let Some(out) = self.absorb_query_state(index, state) {
                        return out;
                    }
                }
            }
            PoolEvent::Poll => {}
        }
        self.poll_queries(now)
    }

    /// Register a new query unless the id is already taken.
    fn add_query(
        &mut self,
        now: Instant,
        query_id: QueryId,
        target: Key,
        message: Option<M>,
        seed: &[NodeId],
    ) {
        if self.contains(query_id) {
            debug!(%query_id, "rejecting duplicate query id");
            return;
        }
        self.queries.push(Query::new(
            query_id,
            self.self_id,
            target,
            message,
            seed,
            self.config.request_concurrency,
            self.config.num_results,
            now,
        ));
    }

    fn index_of(&self, query_id: QueryId) -> Option<usize> {
        self.queries.iter().position(|query| query.id() == query_id)
    }

    /// Drop the query at `index`, keeping the round-robin cursor aligned.
    fn remove(&mut self, index: usize) {
        self.queries.remove(index);
        if index < self.next_query_index {
            self.next_query_index -= 1;
        }
        if self.next_query_index >= self.queries.len() {
            self.next_query_index = 0;
        }
    }

    /// Translate a query's output into a pool output, removing finished
    /// queries. Returns `None` for waiting states so the caller can go on
    /// polling other queries.
    fn absorb_query_state(&mut self, index: usize, state: QueryState<M>) -> Option<PoolState<M>> {
        match state {
            QueryState::FindCloser {
                query_id,
                node,
                target,
            } => Some(PoolState::FindCloser {
                query_id,
                node,
                target,
            }),
            QueryState::SendMessage {
                query_id,
                node,
                message,
            } => Some(PoolState::SendMessage {
                query_id,
                node,
                message,
            }),
            QueryState::Finished {
                query_id,
                closest_nodes,
                stats,
            } => {
                self.remove(index);
                Some(PoolState::QueryFinished {
                    query_id,
                    closest_nodes,
                    stats,
                })
            }
            QueryState::WaitingAtCapacity | QueryState::WaitingWithCapacity => None,
        }
    }

    /// Fire due timeouts, then hand the next round-robin query a chance to
    /// dispatch.
    fn poll_queries(&mut self, now: Instant) -> PoolState<M> {
        for index in 0..self.queries.len() {
            let query = &self.queries[index];
            // In-flight requests do not count as progress; only successful
            // responses move last_progress_at.
            if now.duration_since(query.last_progress_at()) > self.config.timeout {
                let query_id = query.id();
                debug!(%query_id, "query made no progress within the timeout");
                self.remove(index);
                return PoolState::QueryTimeout { query_id };
            }
        }

        if self.in_flight() >= self.config.concurrency {
            return PoolState::WaitingAtCapacity;
        }

        let count = self.queries.len();
        if count > 0 {
            for step in 0..count {
                let index = (self.next_query_index + step) % count;
                let state = self.queries[index].advance(now, QueryEvent::Poll);
                match state {
                    QueryState::WaitingAtCapacity | QueryState::WaitingWithCapacity => continue,
                    dispatch_or_finish => {
                        if let Some(out) = self.absorb_query_state(index, dispatch_or_finish) {
                            self.next_query_index = if self.queries.is_empty() {
                                0
                            } else {
                                (index + 1) % self.queries.len()
                            };
                            return out;
                        }
                    }
                }
            }
        }

        if self.in_flight() > 0 {
            PoolState::WaitingWithCapacity
        } else {
            PoolState::Idle
        }
    }
}
