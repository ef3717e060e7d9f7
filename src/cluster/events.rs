//! Cluster event broadcast.

use crate::cluster::status::ClusterStatus;

/// Events emitted by the cluster over its broadcast channel.
///
/// Delivery is asynchronous: listeners observe events in issue order but
/// on their own task, never re-entrantly inside the call that caused the
/// event.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// The lifecycle status changed; the payload is the new status.
    Status(ClusterStatus),
    /// A node client was added to the pool.
    NodeAdded(String),
    /// A node client was removed from the pool.
    NodeRemoved(String),
    /// A node reported an unrecoverable error. The node stays in the pool
    /// until a topology reconcile removes it.
    NodeError {
        /// Canonical key of the node.
        node: String,
        /// Display form of the error.
        message: String,
    },
    /// The slot layout was rebuilt from a live node.
    Refresh,
    /// A fatal topology failure; the pool is about to be emptied.
    Error(String),
    /// The pool went from non-empty to empty.
    Drain,
}
