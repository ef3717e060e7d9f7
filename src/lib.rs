//! # Shoal
//!
//! Cluster client for slot-sharded in-memory stores. Keys are distributed
//! across nodes over a fixed space of 16384 hash slots; shoal keeps a live
//! map from slot to owning node, dispatches every command to the right
//! node, and recovers from redirects, failovers and transient cluster
//! unavailability without surfacing them to the caller.
//!
//! ## Features
//!
//! - **Slot-based routing**: commands are routed by the hash slot of their
//!   first key, with hash-tag (`{...}`) support
//! - **Redirect handling**: `MOVED` and `ASK` redirects are followed
//!   transparently, bounded by a per-command redirection budget
//! - **Topology tracking**: the slot layout is refreshed periodically and
//!   reactively after redirects or cluster-down conditions
//! - **Read scaling**: readonly commands can be spread over replicas
//! - **Offline queueing**: commands submitted before the cluster is ready
//!   are buffered and drained in order once it is
//! - **Pub/sub**: a dedicated subscriber connection that survives node loss
//!
//! ## Example
//!
//! ```no_run
//! use shoal::{Cluster, ClusterOptions};
//! use shoal::core::command::Cmd;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ClusterOptions::new(vec!["127.0.0.1:7000".into()]);
//!     let cluster = Cluster::new(options)?;
//!     cluster.connect().await?;
//!
//!     cluster.send(Cmd::new("SET").arg("key").arg("value")).await?;
//!     let reply = cluster.send(Cmd::new("GET").arg("key")).await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Cluster routing, topology tracking and lifecycle management.
pub mod cluster;
/// Single-node client plumbing: commands, connections, multiplexing.
pub mod core;
/// Wire protocol: frames, codec and the crate error type.
pub mod proto;

pub use crate::cluster::options::{ClusterOptions, NodeOptions, ScaleReads};
pub use crate::cluster::slots::key_slot;
pub use crate::cluster::status::ClusterStatus;
pub use crate::cluster::{Cluster, ClusterEvent, PinnedNode, PushMessage};
pub use crate::core::command::Cmd;
pub use crate::proto::error::{Error, Result};
pub use crate::proto::frame::Frame;
