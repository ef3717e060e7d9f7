//! Cluster routing and lifecycle.
//!
//! The cluster client keeps a live map from the 16384 hash slots to the
//! nodes owning them, dispatches every command to the right node, and
//! recovers from `MOVED`/`ASK` redirects, transient unavailability and
//! failovers without surfacing them to the caller.
//!
//! ## Architecture
//!
//! - [`slots::SlotMap`] maps each slot to an ordered node-key list,
//!   primary first
//! - [`pool`] owns one client per node, keyed by canonical `host:port`
//! - [`topology`] rebuilds the slot map from a live node, periodically
//!   and reactively
//! - [`delay_queue::DelayQueue`] coalesces retry storms into one burst
//!   per cluster event
//! - [`offline::OfflineQueue`] buffers commands until the cluster is
//!   ready
//! - [`subscriber`] maintains the pub/sub connection across node churn
//! - [`client::Cluster`] ties it all together: routing, redirect
//!   handling, bounded retries and the lifecycle status machine

/// The cluster client and command router.
pub mod client;
/// Coalescing retry scheduler.
pub mod delay_queue;
pub(crate) mod errors;
/// Cluster event definitions.
pub mod events;
/// Offline command buffering.
pub mod offline;
/// Cluster configuration.
pub mod options;
/// Node clients and the connection pool.
pub mod pool;
/// Slot hashing and the slot map.
pub mod slots;
/// Lifecycle status machine.
pub mod status;
/// Pub/sub subscriber handling.
pub mod subscriber;
pub(crate) mod topology;

pub use client::{Cluster, PinnedNode};
pub use events::ClusterEvent;
pub use subscriber::PushMessage;
