//! Error types surfaced by the coordination core.
//!
//! Node-level failures are absorbed into per-node state and only show up in
//! query stats and broadcast error maps; the types here exist so callers can
//! match on the reason when they do see one.

use thiserror::Error;

use crate::core::QueryId;

/// A component was constructed from an invalid configuration.
///
/// Returned immediately by constructors; nothing is partially built.
#[derive(Debug, Error)]
#[error("invalid {component} configuration: {reason}")]
pub struct ConfigurationError {
    /// Name of the component that rejected its configuration.
    pub component: &'static str,
    /// Human-readable description of the violated constraint.
    pub reason: String,
}

impl ConfigurationError {
    pub(crate) fn new(component: &'static str, reason: impl Into<String>) -> Self {
        Self {
            component,
            reason: reason.into(),
        }
    }
}

/// A query was started under an id the pool is already running.
///
/// The running query is unaffected; only the duplicate start is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0} already exists")]
pub struct QueryExists(pub QueryId);

/// Why a single node dropped out of a query or broadcast.
///
/// These errors are recoverable from the query's point of view: the node is
/// marked unreachable and the lookup continues with the remaining
/// candidates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The transport could not reach the node or the connection failed.
    #[error("node is unreachable: {0}")]
    Unreachable(String),
    /// The node did not answer before the per-request deadline.
    ///
    /// Produced by the transport, which owns the request timer; the core
    /// only ever sees the resulting failure event.
    #[error("request timed out")]
    RequestTimeout,
    /// The surrounding operation was stopped before the node answered.
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_names_component_and_reason() {
        let err = ConfigurationError::new("PoolConfig", "concurrency must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid PoolConfig configuration: concurrency must be at least 1"
        );
    }

    #[test]
    fn query_exists_displays_offending_id() {
        let err = QueryExists(QueryId(3));
        assert_eq!(err.to_string(), "query-3 already exists");
    }

    #[test]
    fn node_error_messages_are_stable() {
        assert_eq!(
            NodeError::Unreachable("connection refused".into()).to_string(),
            "node is unreachable: connection refused"
        );
        assert_eq!(NodeError::RequestTimeout.to_string(), "request timed out");
        assert_eq!(NodeError::Cancelled.to_string(), "cancelled");
    }
}
