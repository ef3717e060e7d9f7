//! Node clients and the cluster connection pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::cluster::events::ClusterEvent;
use crate::cluster::options::NodeOptions;
use crate::core::command;
use crate::core::connection;
use crate::core::multiplexed::MultiplexedConnection;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Role filter for [`ConnectionPool::nodes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Every node.
    All,
    /// Primaries only.
    Master,
    /// Replicas only.
    Slave,
}

/// Authoritative description of one pool member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Host name or address, brackets retained for IPv6.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether the node serves as a replica.
    pub read_only: bool,
}

impl NodeSpec {
    /// Canonical pool key of this endpoint.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A single-node client owned by the pool.
///
/// The TCP connection is opened lazily on first use and re-opened after a
/// loss. Replica nodes issue a `READONLY` handshake so readonly commands
/// are accepted.
pub struct Node {
    host: String,
    port: u16,
    key: String,
    read_only: AtomicBool,
    options: NodeOptions,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("read_only", &self.read_only.load(Ordering::Relaxed))
            .finish()
    }
}

impl Node {
    fn new(
        host: String,
        port: u16,
        read_only: bool,
        options: NodeOptions,
        events: broadcast::Sender<ClusterEvent>,
    ) -> Arc<Self> {
        let key = format!("{}:{}", host, port);
        Arc::new(Self {
            host,
            port,
            key,
            read_only: AtomicBool::new(read_only),
            options,
            conn: tokio::sync::Mutex::new(None),
            events,
        })
    }

    /// Canonical `host:port` key of this node.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Host part of the endpoint.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part of the endpoint.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether this node currently serves as a replica.
    pub fn is_replica(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    /// Returns a live client, connecting when necessary.
    pub async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        trace!("connecting to {}", self.key);
        let mut raw =
            connection::connect(&self.host, self.port, self.options.connect_timeout).await?;
        if let Some(password) = &self.options.password {
            raw.write_frame(&command::auth(password.clone()).into_frame())
                .await?;
            if let Frame::Error(e) = raw.read_frame().await? {
                return Err(Error::Server {
                    message: String::from_utf8_lossy(&e).into_owned(),
                });
            }
        }

        let conn = MultiplexedConnection::new(raw);
        if self.is_replica() {
            let _ = conn.send(command::readonly().into_frame()).await?;
        }
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Sends one command to this node.
    ///
    /// Connection failures are re-broadcast as [`ClusterEvent::NodeError`]
    /// before being returned; the node itself stays in the pool.
    pub async fn send(&self, frame: Frame) -> Result<Frame> {
        let result = async {
            let conn = self.connection().await?;
            conn.send(frame).await
        }
        .await;
        if let Err(e) = &result {
            if e.is_connection_error() {
                let _ = self.events.send(ClusterEvent::NodeError {
                    node: self.key.clone(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    /// Drops the cached connection so the next use reconnects.
    pub fn disconnect(&self) {
        if let Ok(mut slot) = self.conn.try_lock() {
            *slot = None;
        }
    }
}

/// Owner of every node client, keyed by canonical `host:port`.
///
/// Membership changes only through [`reset`](ConnectionPool::reset) and
/// [`find_or_create`](ConnectionPool::find_or_create); node errors never
/// remove a member on their own.
pub struct ConnectionPool {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    reconcile: Mutex<()>,
    events: broadcast::Sender<ClusterEvent>,
    node_options: NodeOptions,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("nodes", &self.nodes.read().unwrap().len())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub fn new(events: broadcast::Sender<ClusterEvent>, node_options: NodeOptions) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            reconcile: Mutex::new(()),
            events,
            node_options,
        }
    }

    /// Returns the node for `key`, if it is a member.
    pub fn get(&self, key: &str) -> Option<Arc<Node>> {
        self.nodes.read().unwrap().get(key).cloned()
    }

    /// Returns members matching `role`.
    pub fn nodes(&self, role: NodeRole) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|node| match role {
                NodeRole::All => true,
                NodeRole::Master => !node.is_replica(),
                NodeRole::Slave => node.is_replica(),
            })
            .cloned()
            .collect()
    }

    /// Returns the member keys.
    pub fn keys(&self) -> Vec<String> {
        self.nodes.read().unwrap().keys().cloned().collect()
    }

    /// Returns true when the pool has no members.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }

    /// Returns the member count.
    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    /// Returns the node for an endpoint, creating it when absent.
    ///
    /// Passing a role updates an existing node's classification; `None`
    /// leaves it untouched and creates new nodes as primaries.
    pub fn find_or_create(
        &self,
        host: &str,
        port: u16,
        read_only: Option<bool>,
    ) -> Arc<Node> {
        let key = format!("{}:{}", host, port);
        if let Some(node) = self.get(&key) {
            if let Some(read_only) = read_only {
                node.set_read_only(read_only);
            }
            return node;
        }

        let mut nodes = self.nodes.write().unwrap();
        // Lost the race: another task inserted it first.
        if let Some(node) = nodes.get(&key) {
            if let Some(read_only) = read_only {
                node.set_read_only(read_only);
            }
            return node.clone();
        }

        let node = Node::new(
            host.to_string(),
            port,
            read_only.unwrap_or(false),
            self.node_options.clone(),
            self.events.clone(),
        );
        nodes.insert(key.clone(), node.clone());
        drop(nodes);

        debug!("+node {}", key);
        let _ = self.events.send(ClusterEvent::NodeAdded(key));
        node
    }

    /// Reconciles membership against an authoritative node list.
    ///
    /// Missing nodes are created, absent ones removed and disconnected,
    /// surviving ones have their role updated. Emits one event per
    /// addition and removal, and `Drain` when a previously non-empty pool
    /// ends up empty.
    pub fn reset(&self, specs: &[NodeSpec]) {
        // One reconcile at a time; lookups stay lock-free in between.
        let _guard = self.reconcile.lock().unwrap();

        let had_members = !self.is_empty();

        for spec in specs {
            self.find_or_create(&spec.host, spec.port, Some(spec.read_only));
        }

        let wanted: std::collections::HashSet<String> =
            specs.iter().map(|spec| spec.key()).collect();
        let stale: Vec<(String, Arc<Node>)> = {
            let nodes = self.nodes.read().unwrap();
            nodes
                .iter()
                .filter(|(key, _)| !wanted.contains(*key))
                .map(|(key, node)| (key.clone(), node.clone()))
                .collect()
        };

        if !stale.is_empty() {
            let mut nodes = self.nodes.write().unwrap();
            for (key, _) in &stale {
                nodes.remove(key);
            }
        }
        for (key, node) in stale {
            node.disconnect();
            debug!("-node {}", key);
            let _ = self.events.send(ClusterEvent::NodeRemoved(key));
        }

        if had_members && self.is_empty() {
            let _ = self.events.send(ClusterEvent::Drain);
        }
    }
}
