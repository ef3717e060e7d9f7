//! Topology discovery and reconciliation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cluster::errors::split_address;
use crate::cluster::events::ClusterEvent;
use crate::cluster::pool::{ConnectionPool, NodeSpec};
use crate::cluster::slots::SlotMap;
use crate::cluster::status::{ClusterStatus, StatusMachine};
use crate::core::command;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// One row of the slot layout: a slot range and the ordered node keys
/// serving it, primary first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub nodes: Vec<NodeSpec>,
}

/// Rebuilds the slot map from a live node and reconciles the pool.
///
/// Refreshes are serialized: while one is in flight, further calls return
/// immediately and are satisfied by the outcome of the running one.
pub(crate) struct TopologyRefresher {
    pool: Arc<ConnectionPool>,
    slots: Arc<SlotMap>,
    status: Arc<StatusMachine>,
    events: broadcast::Sender<ClusterEvent>,
    refreshing: AtomicBool,
    timeout: Duration,
}

impl TopologyRefresher {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        slots: Arc<SlotMap>,
        status: Arc<StatusMachine>,
        events: broadcast::Sender<ClusterEvent>,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            slots,
            status,
            events,
            refreshing: AtomicBool::new(false),
            timeout,
        }
    }

    /// Queries the cluster for the authoritative slot layout and applies
    /// it.
    ///
    /// Candidate nodes are tried in shuffled order. A node that fails or
    /// times out is disconnected and skipped. When every candidate fails
    /// the error is [`Error::RefreshFailed`] carrying the last per-node
    /// cause.
    pub(crate) async fn refresh(&self) -> Result<()> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Another refresh is running; its outcome covers this call.
            return Ok(());
        }
        let result = self.refresh_inner().await;
        self.refreshing.store(false, Ordering::SeqCst);
        result
    }

    async fn refresh_inner(&self) -> Result<()> {
        let mut keys = self.pool.keys();
        keys.shuffle(&mut thread_rng());

        let mut last_error = Error::Protocol {
            message: "connection pool is empty".to_string(),
        };

        for key in keys {
            if self.status.status() == ClusterStatus::End {
                return Err(Error::Disconnected);
            }
            let Some(node) = self.pool.get(&key) else {
                continue;
            };

            let reply = tokio::time::timeout(
                self.timeout,
                node.send(command::cluster_slots().into_frame()),
            )
            .await;

            let frame = match reply {
                Err(_) => {
                    debug!("slot layout query timed out on {}", key);
                    node.disconnect();
                    last_error = Error::Io {
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "slot layout query timed out",
                        ),
                    };
                    continue;
                }
                Ok(Err(e)) => {
                    debug!("slot layout query failed on {}: {}", key, e);
                    node.disconnect();
                    last_error = e;
                    continue;
                }
                Ok(Ok(Frame::Error(e))) => {
                    debug!(
                        "slot layout query rejected by {}: {}",
                        key,
                        String::from_utf8_lossy(&e)
                    );
                    node.disconnect();
                    last_error = Error::Server {
                        message: String::from_utf8_lossy(&e).into_owned(),
                    };
                    continue;
                }
                Ok(Ok(frame)) => frame,
            };

            match parse_slot_ranges(frame) {
                Ok(ranges) => {
                    self.apply(&ranges);
                    let _ = self.events.send(ClusterEvent::Refresh);
                    return Ok(());
                }
                Err(e) => {
                    warn!("malformed slot layout from {}: {}", key, e);
                    node.disconnect();
                    last_error = e;
                }
            }
        }

        Err(Error::RefreshFailed {
            last: Box::new(last_error),
        })
    }

    /// Applies a parsed layout: pool first so every key the new slot map
    /// references resolves, then the slot assignment in one swap.
    fn apply(&self, ranges: &[SlotRange]) {
        let mut specs: Vec<NodeSpec> = Vec::new();
        for range in ranges {
            for node in &range.nodes {
                if !specs.iter().any(|existing| existing.key() == node.key()) {
                    specs.push(node.clone());
                }
            }
        }

        self.pool.reset(&specs);
        let assignment: Vec<(u16, u16, Vec<String>)> = ranges
            .iter()
            .map(|range| {
                (
                    range.start,
                    range.end,
                    range.nodes.iter().map(NodeSpec::key).collect(),
                )
            })
            .collect();
        self.slots.rebuild(&assignment);
        debug!(
            "topology refreshed: {} ranges over {} nodes",
            ranges.len(),
            specs.len()
        );
    }
}

/// Parses a slot layout reply.
///
/// Rows look like `[start, end, primary, replica...]` where each endpoint
/// is `[host, port, ...]`. The first endpoint of a row is the primary,
/// the rest are replicas. Malformed rows and endpoints are skipped.
pub(crate) fn parse_slot_ranges(frame: Frame) -> Result<Vec<SlotRange>> {
    let rows = match frame {
        Frame::Array(rows) => rows,
        _ => {
            return Err(Error::Protocol {
                message: "slot layout reply must be an array".to_string(),
            })
        }
    };

    let mut ranges = Vec::with_capacity(rows.len());
    for row in rows {
        let Frame::Array(items) = row else { continue };
        if items.len() < 3 {
            continue;
        }

        let (Some(start), Some(end)) = (items[0].as_integer(), items[1].as_integer()) else {
            continue;
        };
        if !(0..16384).contains(&start) || !(0..16384).contains(&end) || end < start {
            continue;
        }

        let mut nodes = Vec::new();
        for (index, endpoint) in items[2..].iter().enumerate() {
            if let Some(spec) = parse_endpoint(endpoint, index > 0) {
                nodes.push(spec);
            }
        }
        if nodes.is_empty() {
            continue;
        }

        ranges.push(SlotRange {
            start: start as u16,
            end: end as u16,
            nodes,
        });
    }

    if ranges.is_empty() {
        return Err(Error::Protocol {
            message: "slot layout reply contains no usable ranges".to_string(),
        });
    }
    Ok(ranges)
}

fn parse_endpoint(frame: &Frame, read_only: bool) -> Option<NodeSpec> {
    let items = frame.as_array()?;
    let host = match items.first()? {
        Frame::BulkString(Some(host)) if !host.is_empty() => {
            String::from_utf8_lossy(host).into_owned()
        }
        _ => return None,
    };
    let port = items.get(1)?.as_integer()?;
    let port = u16::try_from(port).ok()?;
    // Bracket raw IPv6 hosts so the canonical key form stays parseable.
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host
    };
    let _ = split_address(&format!("{}:{}", host, port))?;
    Some(NodeSpec {
        host,
        port,
        read_only,
    })
}
