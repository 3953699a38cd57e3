//! Single-lookup state machine.
//!
//! A [`Query`] drives one iterative Kademlia lookup toward a target key. It
//! keeps every node it has heard of in a candidate list ordered by XOR
//! distance to the target, contacts the closest uncontacted candidates
//! first, and bounds how many requests it keeps in flight at once.
//!
//! The machine is a pure synchronous transition function: [`Query::advance`]
//! maps the current internal state plus one [`QueryEvent`] to a new internal
//! state and an output [`QueryState`]. It never blocks, never sleeps, and
//! reads time only through the instant handed to it, so a pool can multiplex
//! many queries and tests can replay exact event sequences.

use tokio::time::Instant;

use crate::core::{distance_cmp, xor_distance, Key, NodeId, QueryId, QueryStats};
use crate::error::NodeError;

/// Contact lifecycle of a single candidate node within a query.
///
/// States only move forward: `NotContacted → Waiting → {Succeeded,
/// Unreachable}`. A node is never contacted again once terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Known but not yet contacted.
    NotContacted,
    /// A request to the node is in flight.
    Waiting,
    /// The node answered.
    Succeeded,
    /// The request failed or timed out; the node is out of the lookup.
    Unreachable,
}

/// One candidate node tracked by a query.
#[derive(Debug)]
struct NodeEntry {
    id: NodeId,
    /// XOR distance between `id` and the query target, cached on insert.
    distance: [u8; 32],
    state: NodeState,
    last_contacted_at: Option<Instant>,
}

/// Input events a query reacts to.
#[derive(Clone, Debug)]
pub enum QueryEvent {
    /// Give the query a chance to dispatch work or detect completion.
    Poll,
    /// A contacted node answered, possibly reporting closer peers.
    NodeResponse {
        node: NodeId,
        closer_nodes: Vec<NodeId>,
    },
    /// A contacted node could not be reached.
    NodeFailure { node: NodeId, error: NodeError },
    /// Terminate the lookup with whatever has succeeded so far.
    Stop,
}

/// Output states produced by [`Query::advance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryState<M> {
    /// Ask `node` for peers closer to `target`.
    FindCloser {
        query_id: QueryId,
        node: NodeId,
        target: Key,
    },
    /// Deliver the query's message payload to `node`.
    SendMessage {
        query_id: QueryId,
        node: NodeId,
        message: M,
    },
    /// The per-query request bound is exhausted; wait for replies.
    WaitingAtCapacity,
    /// No candidate is ready but replies are outstanding.
    WaitingWithCapacity,
    /// The lookup is complete.
    Finished {
        query_id: QueryId,
        /// The closest nodes that answered, ascending by distance to the
        /// target, at most the configured window size.
        closest_nodes: Vec<NodeId>,
        stats: QueryStats,
    },
}

/// State machine for one iterative lookup.
#[derive(Debug)]
pub struct Query<M> {
    id: QueryId,
    target: Key,
    /// The local node; reported peers matching it are never contacted.
    self_id: NodeId,
    /// Payload for message-carrying queries. `None` means the query asks
    /// plain "find closer" questions.
    message: Option<M>,
    /// Candidates ascending by XOR distance to `target`.
    nodes: Vec<NodeEntry>,
    /// Number of entries currently in [`NodeState::Waiting`].
    in_flight: usize,
    stats: QueryStats,
    started_at: Instant,
    /// Stamp of the most recent successful response. Failures do not count
    /// as progress.
    last_progress_at: Instant,
    request_concurrency: usize,
    /// Size of the closest-K window that steers candidate selection and
    /// caps the result set.
    num_results: usize,
    finished: bool,
}

impl<M: Clone> Query<M> {
    /// Create a query seeded with the caller's closest known nodes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: QueryId,
        self_id: NodeId,
        target: Key,
        message: Option<M>,
        seed: &[NodeId],
        request_concurrency: usize,
        num_results: usize,
        now: Instant,
    ) -> Self {
        let mut query = Self {
            id,
            target,
            self_id,
            message,
            nodes: Vec::with_capacity(seed.len()),
            in_flight: 0,
            stats: QueryStats::default(),
            started_at: now,
            last_progress_at: now,
            request_concurrency,
            num_results,
            finished: false,
        };
        for node in seed {
            query.track_candidate(*node);
        }
        query
    }

    /// The id this query was started under.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The key the lookup is converging on.
    pub fn target(&self) -> Key {
        self.target
    }

    /// Number of requests currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> QueryStats {
        self.stats
    }

    /// When the query was created.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the query last saw a successful response (or was created).
    pub fn last_progress_at(&self) -> Instant {
        self.last_progress_at
    }

    /// Whether the query has reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// When a request was last dispatched to `node`, if ever.
    pub fn last_contacted(&self, node: &NodeId) -> Option<Instant> {
        self.nodes
            .iter()
            .find(|entry| entry.id == *node)
            .and_then(|entry| entry.last_contacted_at)
    }

    /// Advance the machine with one event, sampling time from `now`.
    pub fn advance(&mut self, now: Instant, event: QueryEvent) -> QueryState<M> {
        match event {
            QueryEvent::Poll => {}
            QueryEvent::NodeResponse { node, closer_nodes } => {
                self.on_response(now, node, closer_nodes);
            }
            QueryEvent::NodeFailure { node, error: _ } => {
                self.on_failure(node);
            }
            QueryEvent::Stop => {
                self.finished = true;
            }
        }
        self.next(now)
    }

    /// Record a successful response and absorb any reported closer peers.
    fn on_response(&mut self, now: Instant, node: NodeId, closer_nodes: Vec<NodeId>) {
        if self.finished {
            return;
        }
        let Some(entry) = self.nodes.iter_mut().find(|entry| entry.id == node) else {
            return;
        };
        if entry.state != NodeState::Waiting {
            // late or duplicate reply for a node that already settled
            return;
        }
        entry.state = NodeState::Succeeded;
        self.in_flight -= 1;
        self.stats.successes += 1;
        self.last_progress_at = now;

        for candidate in closer_nodes {
            self.track_candidate(candidate);
        }
    }

    /// Demote an unreachable node. Failures never count as progress.
    fn on_failure(&mut self, node: NodeId) {
        if self.finished {
            return;
        }
        let Some(entry) = self.nodes.iter_mut().find(|entry| entry.id == node) else {
            return;
        };
        if entry.state != NodeState::Waiting {
            return;
        }
        entry.state = NodeState::Unreachable;
        self.in_flight -= 1;
        self.stats.failures += 1;
    }

    /// Insert a candidate in distance order unless it is the local node or
    /// already tracked.
    fn track_candidate(&mut self, id: NodeId) {
        if id == self.self_id {
            return;
        }
        let distance = xor_distance(&id, &self.target);
        let position = self.nodes.binary_search_by(|entry| {
            distance_cmp(&entry.distance, &distance).then_with(|| entry.id.cmp(&id))
        });
        if let Err(index) = position {
            self.nodes.insert(
                index,
                NodeEntry {
                    id,
                    distance,
                    state: NodeState::NotContacted,
                    last_contacted_at: None,
                },
            );
        }
    }

    /// Pick the next output state.
    ///
    /// Selection walks candidates in ascending distance, counting the
    /// closest `num_results` entries that are not unreachable as the active
    /// window. The first uncontacted node in the window is dispatched; if
    /// the window holds only succeeded nodes the lookup is done.
    fn next(&mut self, now: Instant) -> QueryState<M> {
        if self.finished {
            return self.finished_state();
        }
        if self.in_flight >= self.request_concurrency {
            return QueryState::WaitingAtCapacity;
        }

        let mut window_len = 0;
        let mut waiting_in_window = false;
        let mut candidate: Option<usize> = None;
        for (index, entry) in self.nodes.iter().enumerate() {
            if window_len >= self.num_results {
                break;
            }
            match entry.state {
                NodeState::Unreachable => continue,
                NodeState::Succeeded => window_len += 1,
                NodeState::Waiting => {
                    window_len += 1;
                    waiting_in_window = true;
                }
                NodeState::NotContacted => {
                    window_len += 1;
                    if candidate.is_none() {
                        candidate = Some(index);
                    }
                }
            }
        }

        if let Some(index) = candidate {
            let entry = &mut self.nodes[index];
            entry.state = NodeState::Waiting;
            entry.last_contacted_at = Some(now);
            self.in_flight += 1;
            self.stats.requests += 1;
            let node = entry.id;
            return match &self.message {
                Some(message) => QueryState::SendMessage {
                    query_id: self.id,
                    node,
                    message: message.clone(),
                },
                None => QueryState::FindCloser {
                    query_id: self.id,
                    node,
                    target: self.target,
                },
            };
        }

        if waiting_in_window {
            return QueryState::WaitingWithCapacity;
        }

        // Every node in the window has succeeded (or nothing reachable
        // remains): the lookup has converged.
        self.finished = true;
        self.finished_state()
    }

    /// Terminal state listing the closest succeeded nodes in distance order.
    fn finished_state(&self) -> QueryState<M> {
        let closest_nodes = self
            .nodes
            .iter()
            .filter(|entry| entry.state == NodeState::Succeeded)
            .take(self.num_results)
            .map(|entry| entry.id)
            .collect();
        QueryState::Finished {
            query_id: self.id,
            closest_nodes,
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(n: u8) -> NodeId {
        let mut id = [0u8; 32];
        id[31] = n;
        id
    }

    fn self_id() -> NodeId {
        let mut id = [0u8; 32];
        id[0] = 0xff;
        id
    }

    fn find_closer_query(seed: &[NodeId], request_concurrency: usize) -> Query<()> {
        Query::new(
            QueryId(1),
            self_id(),
            [0u8; 32],
            None,
            seed,
            request_concurrency,
            20,
            Instant::now(),
        )
    }

    fn dispatched_node(state: QueryState<()>) -> NodeId {
        match state {
            QueryState::FindCloser { node, .. } => node,
            other => panic!("expected FindCloser, got {other:?}"),
        }
    }

    #[test]
    fn poll_contacts_closest_seed_first() {
        // target is all zeroes, so nid(n) is at distance n
        let mut query = find_closer_query(&[nid(9), nid(2), nid(5)], 3);
        let now = Instant::now();

        assert_eq!(dispatched_node(query.advance(now, QueryEvent::Poll)), nid(2));
        assert_eq!(dispatched_node(query.advance(now, QueryEvent::Poll)), nid(5));
        assert_eq!(dispatched_node(query.advance(now, QueryEvent::Poll)), nid(9));
    }

    #[test]
    fn poll_respects_request_concurrency() {
        let mut query = find_closer_query(&[nid(1), nid(2), nid(3)], 2);
        let now = Instant::now();

        query.advance(now, QueryEvent::Poll);
        query.advance(now, QueryEvent::Poll);
        assert_eq!(query.in_flight(), 2);
        assert_eq!(
            query.advance(now, QueryEvent::Poll),
            QueryState::WaitingAtCapacity
        );

        // one reply frees a slot for the third seed
        let state = query.advance(
            now,
            QueryEvent::NodeResponse {
                node: nid(1),
                closer_nodes: vec![],
            },
        );
        assert_eq!(dispatched_node(state), nid(3));
        assert_eq!(query.in_flight(), 2);
    }

    #[test]
    fn response_inserts_closer_peers_into_frontier() {
        let mut query = find_closer_query(&[nid(8)], 3);
        let now = Instant::now();

        query.advance(now, QueryEvent::Poll);
        let state = query.advance(
            now,
            QueryEvent::NodeResponse {
                node: nid(8),
                closer_nodes: vec![nid(3), nid(12)],
            },
        );
        // the newly learned node at distance 3 is contacted before distance 12
        assert_eq!(dispatched_node(state), nid(3));
    }

    #[test]
    fn reported_self_is_never_contacted() {
        let mut query = find_closer_query(&[nid(8)], 3);
        let now = Instant::now();

        query.advance(now, QueryEvent::Poll);
        query.advance(
            now,
            QueryEvent::NodeResponse {
                node: nid(8),
                closer_nodes: vec![self_id()],
            },
        );
        let state = query.advance(now, QueryEvent::Poll);
        assert!(
            matches!(state, QueryState::Finished { .. }),
            "self must not become a candidate, got {state:?}"
        );
    }

    #[test]
    fn failure_demotes_node_and_lookup_continues() {
        let mut query = find_closer_query(&[nid(1), nid(2)], 2);
        let now = Instant::now();

        query.advance(now, QueryEvent::Poll);
        query.advance(now, QueryEvent::Poll);
        query.advance(
            now,
            QueryEvent::NodeFailure {
                node: nid(1),
                error: NodeError::RequestTimeout,
            },
        );
        let state = query.advance(
            now,
            QueryEvent::NodeResponse {
                node: nid(2),
                closer_nodes: vec![],
            },
        );
        match state {
            QueryState::Finished {
                closest_nodes,
                stats,
                ..
            } => {
                assert_eq!(closest_nodes, vec![nid(2)]);
                assert_eq!(stats.failures, 1);
                assert_eq!(stats.successes, 1);
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn finishes_when_window_is_all_succeeded() {
        // window of one: once the closest candidate succeeds, farther
        // candidates are never contacted
        let mut query = Query::<()>::new(
            QueryId(1),
            self_id(),
            [0u8; 32],
            None,
            &[nid(1), nid(2)],
            3,
            1,
            Instant::now(),
        );
        let now = Instant::now();

        assert_eq!(dispatched_node(query.advance(now, QueryEvent::Poll)), nid(1));
        let state = query.advance(
            now,
            QueryEvent::NodeResponse {
                node: nid(1),
                closer_nodes: vec![],
            },
        );
        match state {
            QueryState::Finished { closest_nodes, .. } => {
                assert_eq!(closest_nodes, vec![nid(1)]);
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn empty_seed_finishes_immediately_with_no_results() {
        let mut query = find_closer_query(&[], 3);
        let state = query.advance(Instant::now(), QueryEvent::Poll);
        match state {
            QueryState::Finished {
                closest_nodes,
                stats,
                ..
            } => {
                assert!(closest_nodes.is_empty());
                assert_eq!(stats, QueryStats::default());
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn stop_finishes_with_nodes_succeeded_so_far() {
        let mut query = find_closer_query(&[nid(1), nid(2), nid(3)], 3);
        let now = Instant::now();

        query.advance(now, QueryEvent::Poll);
        query.advance(now, QueryEvent::Poll);
        query.advance(
            now,
            QueryEvent::NodeResponse {
                node: nid(1),
                closer_nodes: vec![],
            },
        );
        let state = query.advance(now, QueryEvent::Stop);
        match state {
            QueryState::Finished { closest_nodes, .. } => {
                assert_eq!(closest_nodes, vec![nid(1)]);
            }
            other => panic!("expected Finished, got {other:?}"),
        }
        assert!(query.is_finished());
    }

    #[test]
    fn late_reply_after_stop_is_ignored() {
        let mut query = find_closer_query(&[nid(1)], 3);
        let now = Instant::now();

        query.advance(now, QueryEvent::Poll);
        query.advance(now, QueryEvent::Stop);
        let stats_before = query.stats();
        query.advance(
            now,
            QueryEvent::NodeResponse {
                node: nid(1),
                closer_nodes: vec![nid(2)],
            },
        );
        assert_eq!(query.stats(), stats_before);
    }

    #[test]
    fn message_query_dispatches_payload() {
        let mut query = Query::new(
            QueryId(4),
            self_id(),
            [0u8; 32],
            Some("record"),
            &[nid(6)],
            3,
            20,
            Instant::now(),
        );
        match query.advance(Instant::now(), QueryEvent::Poll) {
            QueryState::SendMessage { node, message, .. } => {
                assert_eq!(node, nid(6));
                assert_eq!(message, "record");
            }
            other => panic!("expected SendMessage, got {other:?}"),
        }
    }

    #[test]
    fn in_flight_always_matches_waiting_nodes() {
        let mut query = find_closer_query(&[nid(1), nid(2), nid(3), nid(4)], 2);
        let now = Instant::now();

        let events = [
            QueryEvent::Poll,
            QueryEvent::Poll,
            QueryEvent::NodeFailure {
                node: nid(1),
                error: NodeError::Unreachable("refused".into()),
            },
            QueryEvent::Poll,
            QueryEvent::NodeResponse {
                node: nid(2),
                closer_nodes: vec![nid(5)],
            },
            QueryEvent::Poll,
        ];
        for event in events {
            query.advance(now, event);
            let waiting = query
                .nodes
                .iter()
                .filter(|entry| entry.state == NodeState::Waiting)
                .count();
            assert_eq!(query.in_flight(), waiting);
            assert!(query.in_flight() <= 2);
        }
    }

    #[test]
    fn nodes_never_leave_terminal_states() {
        let mut query = find_closer_query(&[nid(1), nid(2)], 2);
        let now = Instant::now();

        query.advance(now, QueryEvent::Poll);
        query.advance(now, QueryEvent::Poll);
        query.advance(
            now,
            QueryEvent::NodeFailure {
                node: nid(1),
                error: NodeError::RequestTimeout,
            },
        );
        // a reply from a node already marked unreachable must not revive it
        query.advance(
            now,
            QueryEvent::NodeResponse {
                node: nid(1),
                closer_nodes: vec![],
            },
        );
        let entry = query.nodes.iter().find(|e| e.id == nid(1)).unwrap();
        assert_eq!(entry.state, NodeState::Unreachable);
        assert_eq!(query.stats().successes, 0);
    }
}
