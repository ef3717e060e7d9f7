//! Single-node client plumbing.
//!
//! A cluster is driven through many single-node clients. Each one owns a
//! TCP connection, pipelines requests over it and answers them strictly in
//! send order. The cluster layer never touches sockets directly; it only
//! talks to [`multiplexed::MultiplexedConnection`] values handed out by the
//! connection pool.

/// Command construction and the routing catalog.
pub mod command;
/// Framed TCP connection.
pub mod connection;
/// Pipelined request/response client.
pub mod multiplexed;
