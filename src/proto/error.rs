use std::io;

use thiserror::Error;

/// Result type alias for shoal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while talking to a cluster.
///
/// Redirection and retry signals (`Moved`, `Ask`, `TryAgain`,
/// `ClusterDown`) are normally consumed by the router and never reach the
/// caller; they are public because the classification helpers return them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error reply that carries no routing signal.
    #[error("server error: {message}")]
    Server {
        /// Error message from the server.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// The underlying connection was closed.
    #[error("Connection is closed.")]
    ConnectionClosed,

    /// A slot's owner has permanently changed.
    ///
    /// The router updates its slot map and retries against the new owner.
    #[error("MOVED {slot} {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// `host:port` of the node now owning the slot.
        address: String,
    },

    /// A key is temporarily served by another node during resharding.
    ///
    /// The router retries once against the given node with an `ASKING`
    /// preamble and does not touch the slot map.
    #[error("ASK {slot} {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// `host:port` of the node temporarily serving the slot.
        address: String,
    },

    /// Transient per-key unavailability during a multi-key operation.
    #[error("TRYAGAIN {message}")]
    TryAgain {
        /// Message following the token.
        message: String,
    },

    /// The cluster cannot serve any request right now.
    #[error("CLUSTERDOWN {message}")]
    ClusterDown {
        /// Message following the token.
        message: String,
    },

    /// The per-command redirection budget was exhausted.
    #[error("Too many Cluster redirections. Last error: {last}")]
    MaxRedirections {
        /// Display form of the last underlying error.
        last: String,
    },

    /// Every candidate node failed to answer the slot layout query.
    #[error("Failed to refresh slots cache.")]
    RefreshFailed {
        /// The last per-node error observed.
        #[source]
        last: Box<Error>,
    },

    /// The cluster went away while an operation was in flight.
    #[error("Cluster is disconnected.")]
    Disconnected,

    /// The cluster reached its terminal state.
    #[error("Cluster is ended.")]
    Ended,

    /// No subscriber connection is currently established.
    #[error("No subscriber for the cluster")]
    NoSubscriber,

    /// The cluster is not ready and offline queueing is disabled.
    #[error("Cluster isn't ready and enableOfflineQueue options is false")]
    OfflineQueueDisabled,

    /// The offline queue hit its configured capacity.
    #[error("offline queue is full")]
    OfflineQueueFull,

    /// No startup node could be reached.
    #[error("None of startup nodes is available")]
    NoStartupNodes,
}

impl Error {
    /// Returns true for errors caused by a lost or unusable connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Io { .. })
    }
}
